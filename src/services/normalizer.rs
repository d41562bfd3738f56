//! Channel normalization
//!
//! Maps vendor records (portal, Xtream, M3U) onto the canonical [`Channel`].
//! Every field is an ordered lookup over the vendor's known spellings. All
//! functions are pure, so normalizing the same input twice gives identical
//! output, placeholder ids included.

use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::models::{Channel, ChannelSettings};
use crate::services::codec::scalar_string;
use crate::services::m3u_parser::M3uEntry;
use crate::services::portal::{extract_stream_url, GenreMap};
use crate::services::xtream::XtreamCredentials;

pub const UNCATEGORIZED: &str = "Uncategorized";

const ID_KEYS: &[&str] = &["id", "channel_id", "channelId", "stream_id", "tvg-id"];
const NAME_KEYS: &[&str] = &["name", "title", "channel_name", "tvg-name"];
const LOGO_KEYS: &[&str] = &["logo", "logo_url", "stream_icon", "icon", "tvg-logo"];
const GENRE_REF_KEYS: &[&str] = &["tv_genre_id", "genre_id", "category_id"];
const GROUP_KEYS: &[&str] = &["group", "category", "genre", "category_name", "group-title"];
const NUMBER_KEYS: &[&str] = &["number", "num", "tvg-chno"];
const SECRET_KEYS: &[&str] = &["password", "streaming_token", "play_token", "token"];
const SAMPLE_URL_KEYS: &[&str] = &["url", "stream_url", "sample_url", "direct_source"];

/// Uniform field access over vendor records
trait Fields {
    fn field(&self, key: &str) -> Option<String>;

    /// Group to use when no group field is present
    fn group_hint(&self) -> Option<String> {
        None
    }

    fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.field(key))
    }
}

impl Fields for Value {
    fn field(&self, key: &str) -> Option<String> {
        self.get(key).and_then(scalar_string)
    }
}

impl Fields for M3uEntry {
    fn field(&self, key: &str) -> Option<String> {
        let value = match key {
            "title" => Some(self.title.trim()),
            _ => self.attributes.get(key).map(|v| v.trim()),
        };
        value.filter(|v| !v.is_empty()).map(str::to_string)
    }

    fn group_hint(&self) -> Option<String> {
        self.group_hint.clone()
    }
}

/// Native id of a raw record, if it carries one
pub fn native_id(record: &Value) -> Option<String> {
    record.first_of(ID_KEYS)
}

/// Deterministic id for a record without one: `gen_<sha1 prefix>_<index>`
pub fn placeholder_id(seed: &str, index: usize) -> String {
    let digest = Sha1::digest(seed.as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
    format!("gen_{}_{}", hex, index)
}

/// Shared field chains; `cmd` is supplied by the vendor-specific caller
fn normalize_record(
    record: &impl Fields,
    index: usize,
    genres: &GenreMap,
    cmd: Option<String>,
) -> Channel {
    let native = record.first_of(ID_KEYS);
    let name = record
        .first_of(NAME_KEYS)
        .unwrap_or_else(|| format!("Channel {}", index + 1));

    let channel_id = native.clone().unwrap_or_else(|| {
        let seed = cmd.as_deref().unwrap_or(&name);
        placeholder_id(seed, index)
    });

    let group = record
        .first_of(GENRE_REF_KEYS)
        .and_then(|genre_id| genres.get(&genre_id).cloned())
        .or_else(|| record.first_of(GROUP_KEYS))
        .or_else(|| record.group_hint())
        .unwrap_or_else(|| UNCATEGORIZED.to_string());

    let number = record
        .first_of(NUMBER_KEYS)
        .and_then(|n| n.trim().parse::<i32>().ok());

    Channel {
        channel_id,
        native_id: native,
        name,
        logo: record.first_of(LOGO_KEYS),
        group,
        number,
        cmd,
        secret: record.first_of(SECRET_KEYS),
        sample_url: record.first_of(SAMPLE_URL_KEYS),
        visible: true,
        custom_name: None,
        custom_logo: None,
        custom_order: None,
    }
}

/// Portal `itv` records; `cmd` is the portal's playback command
pub fn normalize_portal(records: &[Value], genres: &GenreMap) -> Vec<Channel> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let cmd = record.field("cmd");
            let mut channel = normalize_record(record, index, genres, cmd);
            if channel.sample_url.is_none() {
                channel.sample_url = channel.cmd.as_deref().and_then(extract_stream_url);
            }
            channel
        })
        .collect()
}

/// Xtream live streams; `cmd` is the deterministic live URL
pub fn normalize_xtream(
    records: &[Value],
    categories: &GenreMap,
    creds: &XtreamCredentials,
) -> Vec<Channel> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let cmd = record
                .field("stream_id")
                .map(|stream_id| creds.live_url(&stream_id))
                .or_else(|| record.field("direct_source"));
            normalize_record(record, index, categories, cmd)
        })
        .collect()
}

/// One M3U entry; `cmd` is the literal stream URL
pub fn normalize_m3u(entry: &M3uEntry) -> Channel {
    let mut channel = normalize_record(entry, entry.index, &GenreMap::new(), Some(entry.url.clone()));
    channel.sample_url = Some(entry.url.clone());
    channel
}

/// Overlay stored per-channel settings
pub fn apply_settings(mut channel: Channel, settings: &ChannelSettings) -> Channel {
    channel.visible = settings.visible;
    channel.custom_name = settings.custom_name.clone();
    channel.custom_logo = settings.custom_logo.clone();
    channel.custom_order = settings.custom_order;
    channel
}
