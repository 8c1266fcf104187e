use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::quota::{DEFAULT_ACCOUNT_TIMEOUT_SECS, RealtimeDbConfig};
use crate::selection::FolderSelection;
use crate::storage::{DEFAULT_TELEGRAM_API_BASE, TelegramBotApiConfig};
use crate::sync::{DEFAULT_MAX_ATTEMPTS, SyncConfig};
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;
pub const MIN_SYNC_INTERVAL_MINUTES: u32 = 15;
pub const DEFAULT_SYNC_INTERVAL_MINUTES: u32 = 60;

pub const CONFIG_DIR_ENV: &str = "PHOTOGRAM_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "PHOTOGRAM_DATA_DIR";
pub const BOT_TOKEN_ENV: &str = "PHOTOGRAM_BOT_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub telegram: TelegramSettings,
    #[serde(default)]
    pub account: AccountSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    /// Absolute folder path -> selected.
    #[serde(default)]
    pub folders: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSettings {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSettings {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub database_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_account_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    #[serde(default)]
    pub only_unmetered: bool,
    #[serde(default)]
    pub media_roots: Vec<String>,
    #[serde(default = "default_upload_delay_ms")]
    pub upload_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_api_base() -> String {
    DEFAULT_TELEGRAM_API_BASE.to_string()
}

fn default_account_timeout_secs() -> u64 {
    DEFAULT_ACCOUNT_TIMEOUT_SECS
}

fn default_interval_minutes() -> u32 {
    DEFAULT_SYNC_INTERVAL_MINUTES
}

fn default_upload_delay_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: default_api_base(),
        }
    }
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            database_url: String::new(),
            auth_token: None,
            timeout_secs: default_account_timeout_secs(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            only_unmetered: false,
            media_roots: Vec::new(),
            upload_delay_ms: default_upload_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            telegram: TelegramSettings::default(),
            account: AccountSettings::default(),
            sync: SyncSettings::default(),
            folders: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn folder_selection(&self) -> FolderSelection {
        self.folders
            .iter()
            .map(|(p, on)| (PathBuf::from(p), *on))
            .collect()
    }

    pub fn set_folder(&mut self, folder: &Path, selected: bool) -> Result<()> {
        let key = folder_key(folder)?;
        self.folders.insert(key, selected);
        Ok(())
    }

    pub fn remove_folder(&mut self, folder: &Path) -> Result<bool> {
        let key = folder_key(folder)?;
        Ok(self.folders.remove(&key).is_some())
    }

    pub fn media_roots(&self) -> Vec<PathBuf> {
        self.sync.media_roots.iter().map(PathBuf::from).collect()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sync.interval_minutes) * 60)
    }

    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(self.account.id.clone(), self.folder_selection());
        config.only_unmetered = self.sync.only_unmetered;
        config.upload_delay = Duration::from_millis(self.sync.upload_delay_ms);
        config.max_attempts = self.sync.max_attempts;
        config.account_timeout = Duration::from_secs(self.account.timeout_secs);
        config
    }

    pub fn telegram_config(&self) -> TelegramBotApiConfig {
        TelegramBotApiConfig {
            bot_token: self.telegram.bot_token.clone(),
            chat_id: self.telegram.chat_id.clone(),
            api_base: self.telegram.api_base.clone(),
        }
    }

    pub fn account_store_config(&self) -> Result<RealtimeDbConfig> {
        if self.account.id.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "account.id must not be empty".to_string(),
            });
        }
        Ok(RealtimeDbConfig {
            database_url: self.account.database_url.clone(),
            auth_token: self.account.auth_token.clone(),
            timeout: Duration::from_secs(self.account.timeout_secs),
        })
    }
}

fn folder_key(folder: &Path) -> Result<String> {
    if !folder.is_absolute() {
        return Err(Error::InvalidConfig {
            message: format!("folder must be an absolute path: {}", folder.display()),
        });
    }
    let s = folder.to_str().ok_or_else(|| Error::NonUtf8Path {
        path: folder.to_path_buf(),
    })?;
    let trimmed = s.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/" } else { trimmed }.to_string())
}

/// `$PHOTOGRAM_CONFIG_DIR`, else `$HOME/.config/photogram`.
pub fn default_config_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(v));
    }
    let home = std::env::var("HOME").map_err(|_| Error::InvalidConfig {
        message: format!("HOME is not set; set {CONFIG_DIR_ENV}"),
    })?;
    Ok(PathBuf::from(home).join(".config").join("photogram"))
}

/// `$PHOTOGRAM_DATA_DIR`, else the config dir.
pub fn default_data_dir(config_dir: &Path) -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir.to_path_buf())
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn control_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("control")
}

/// Touching this file asks the daemon for a manual run.
pub fn sync_trigger_path(data_dir: &Path) -> PathBuf {
    control_dir(data_dir).join("sync-now")
}

/// While this file exists the network counts as metered.
pub fn metered_marker_path(data_dir: &Path) -> PathBuf {
    control_dir(data_dir).join("metered")
}

/// Missing file yields defaults. The bot token environment override is applied.
pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let mut settings = load_settings_file(config_dir)?;
    apply_bot_token_override(&mut settings, std::env::var(BOT_TOKEN_ENV).ok());
    Ok(settings)
}

/// Like [`load_settings`] but without environment overrides, for editing and saving back.
pub fn load_settings_file(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn apply_bot_token_override(settings: &mut Settings, token: Option<String>) {
    if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
        settings.telegram.bot_token = token;
    }
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) | None => {
            let mut s = toml::from_str::<Settings>(&with_version(text, version))?;
            s.version = SETTINGS_SCHEMA_VERSION;
            Ok(s)
        }
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
    }
}

fn with_version(text: &str, version: Option<u32>) -> String {
    match version {
        Some(_) => text.to_string(),
        None => format!("version = {SETTINGS_SCHEMA_VERSION}\n{text}"),
    }
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "unsupported settings schema version: {} (expected {SETTINGS_SCHEMA_VERSION})",
                settings.version
            ),
        });
    }
    if settings.sync.interval_minutes < MIN_SYNC_INTERVAL_MINUTES {
        return Err(Error::InvalidConfig {
            message: format!(
                "sync.interval_minutes must be >= {MIN_SYNC_INTERVAL_MINUTES}; got {}",
                settings.sync.interval_minutes
            ),
        });
    }
    if settings.sync.max_attempts == 0 {
        return Err(Error::InvalidConfig {
            message: "sync.max_attempts must be >= 1".to_string(),
        });
    }
    if settings.account.timeout_secs == 0 {
        return Err(Error::InvalidConfig {
            message: "account.timeout_secs must be >= 1".to_string(),
        });
    }
    if settings.telegram.api_base.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "telegram.api_base must not be empty".to_string(),
        });
    }
    for root in &settings.sync.media_roots {
        if !Path::new(root).is_absolute() {
            return Err(Error::InvalidConfig {
                message: format!("sync.media_roots entries must be absolute: {root}"),
            });
        }
    }
    for folder in settings.folders.keys() {
        if !Path::new(folder).is_absolute() {
            return Err(Error::InvalidConfig {
                message: format!("folders keys must be absolute paths: {folder}"),
            });
        }
    }
    Ok(())
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
