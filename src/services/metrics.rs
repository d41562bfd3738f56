//! Prometheus collectors, registered in the default registry and served by
//! `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref ACTIVE_STREAMS: IntGauge =
        register_int_gauge!("gateway_active_streams", "Streams currently piped to viewers").unwrap();
    pub static ref STREAMS_STARTED: IntCounter =
        register_int_counter!("gateway_streams_started_total", "Upstream connections opened").unwrap();
    pub static ref STREAMS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "gateway_streams_rejected_total",
        "Stream requests refused before connecting",
        &["reason"]
    )
    .unwrap();
    pub static ref SYNC_RUNS: IntCounterVec = register_int_counter_vec!(
        "sync_runs_total",
        "Playlist syncs by source kind and result",
        &["kind", "result"]
    )
    .unwrap();
    pub static ref CHANNELS_SYNCED: IntCounter =
        register_int_counter!("sync_channels_total", "Channels written by syncs").unwrap();
}
