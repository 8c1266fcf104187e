use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub phase: String,
    pub files_seen: u64,
    pub files_uploaded: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub current_folder: Option<String>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: SyncProgress);
}
