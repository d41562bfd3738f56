//! Portal (STB middleware) adapter

pub mod client;
pub mod types;

pub use client::{extract_stream_url, PortalClient};
pub use types::*;
