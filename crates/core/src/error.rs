use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// How the retry policy treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, DNS failures, dropped connections. Worth another attempt.
    Transient,
    Permanent,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("network error: {message}")]
    Network { message: String },

    #[error("telegram bot api error: {message}")]
    Telegram { message: String },

    #[error("account store error: {message}")]
    AccountStore { message: String },

    #[error("access denied: account status is {status}")]
    AccessDenied { status: String },

    #[error("registry too large: {len} chars (max {max}); too many distinct folders")]
    RegistryTooLarge { len: usize, max: usize },

    #[error("upload failed for {path}: {message}")]
    UploadFailed { path: String, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config.invalid",
            Self::Io(_) => "io",
            Self::Sqlite(_) => "sqlite",
            Self::SqliteMigrate(_) => "sqlite.migrate",
            Self::Json(_) => "json.invalid",
            Self::Network { .. } => "network.transient",
            Self::Telegram { .. } => "telegram.rejected",
            Self::AccountStore { .. } => "account.store_rejected",
            Self::AccessDenied { .. } => "access.denied",
            Self::RegistryTooLarge { .. } => "registry.too_large",
            Self::UploadFailed { .. } => "upload.failed",
            Self::Cancelled => "cancelled",
            Self::NonUtf8Path { .. } => "path.non_utf8",
        }
    }

    /// Maps a transport-level reqwest failure. Anything that never produced an HTTP status is
    /// treated as a network problem.
    pub(crate) fn from_transport(context: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            Self::Network {
                message: format!("{context}: {e}"),
            }
        } else {
            Self::Telegram {
                message: format!("{context}: {e}"),
            }
        }
    }
}
