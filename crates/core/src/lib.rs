pub mod activity_log;
pub mod checkpoint;
pub mod clock;
pub mod config;
mod error;
pub mod ledger;
pub mod progress;
pub mod quota;
pub mod registry;
pub mod run_log;
pub mod scanner;
pub mod selection;
pub mod state_db;
pub mod storage;
pub mod sync;
pub mod upload;

pub const APP_NAME: &str = "Photogram";

pub use activity_log::{ActivityEntry, ActivityLog, Level};
pub use checkpoint::CheckpointStore;
pub use error::{Error, ErrorKind, Result};
pub use ledger::{Ledger, LedgerStats, UploadRecord};
pub use quota::{
    AccountRecord, AccountState, AccountStatus, AccountStore, Gatekeeper, InMemoryAccountStore,
    RealtimeDbAccountStore, RealtimeDbConfig,
};
pub use registry::{RegistryClient, RegistryStore, TopicRegistry};
pub use scanner::{CandidateFile, FsMediaIndex, IndexedMedia, MediaIndex};
pub use selection::FolderSelection;
pub use storage::{InMemoryRemote, MediaStorage, TelegramBotApi, TelegramBotApiConfig, TransferMode};
pub use sync::{
    Connectivity, MarkerFileConnectivity, StaticConnectivity, SyncConfig, SyncEngine, SyncLock,
    SyncOptions, SyncOutcome, SyncReport, SyncRequest,
};
