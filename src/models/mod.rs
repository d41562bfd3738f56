pub mod playlist;
pub mod sync;

pub use playlist::{Channel, ChannelSettings, Playlist, PlaylistStatus, SourceKind};
pub use sync::{SyncOutcome, SyncProgress, SyncStage};
