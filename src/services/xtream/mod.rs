//! Xtream Codes Integration
//!
//! Live-TV subset of the Xtream Codes Player API v2:
//!
//! - **API Client**: account check, live categories and live streams
//! - **Detection**: recover credentials from `get.php`, `player_api.php`
//!   and `/live/<user>/<pass>/<id>` URLs
//!
//! ```text
//! http://server:port/player_api.php?username=X&password=Y&action=get_live_streams
//! ```

pub mod client;
pub mod detector;
pub mod types;

pub use client::{XtreamClient, XtreamError};
pub use detector::{extract_credentials, stream_id_of};
pub use types::{XtreamAuthResponse, XtreamCategory, XtreamCredentials};
