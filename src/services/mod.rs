pub mod codec;
pub mod connections;
pub mod fallback;
pub mod gateway;
pub mod m3u_parser;
pub mod metrics;
pub mod normalizer;
pub mod portal;
pub mod progress;
pub mod redis;
pub mod refresher;
pub mod sync;
pub mod token_cache;
pub mod xtream;
