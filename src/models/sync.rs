use serde::{Deserialize, Serialize};

/// Stage of a running sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Starting,
    Authenticating,
    Fetching,
    Saving,
    Cleanup,
    Complete,
    Failed,
}

/// Progress snapshot reported to pollers and event streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub stage: SyncStage,
    pub percent: u8,
    pub message: String,
    pub channel_count: usize,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: i64,
}

impl SyncProgress {
    pub fn new(stage: SyncStage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            message: message.into(),
            channel_count: 0,
            done: false,
            error: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_count(mut self, channel_count: usize) -> Self {
        self.channel_count = channel_count;
        self
    }

    /// Mark as complete
    pub fn complete(channel_count: usize, elapsed_seconds: f64) -> Self {
        let mut progress = Self::new(
            SyncStage::Complete,
            100,
            format!("Synced {} channels in {:.1}s", channel_count, elapsed_seconds),
        );
        progress.channel_count = channel_count;
        progress.done = true;
        progress
    }

    /// Mark as failed
    pub fn failed(error: &str) -> Self {
        let mut progress = Self::new(SyncStage::Failed, 100, "Sync failed");
        progress.done = true;
        progress.error = Some(error.to_string());
        progress
    }
}

/// Result of a successful sync
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub channel_count: usize,
    pub elapsed_seconds: f64,
}
