use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::registry::{RegistryStore, TopicRegistry};
use crate::{Error, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_CONNECT_TIMEOUT_SECS: u64 = 60;
const TELEGRAM_READ_TIMEOUT_SECS: u64 = 60;

/// Bot API transfer mode for a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// `sendPhoto`: recompressed, previewable, picky about formats.
    Photo,
    /// `sendDocument`: byte-exact, accepts anything.
    Document,
}

impl TransferMode {
    pub fn method(self) -> &'static str {
        match self {
            Self::Photo => "sendPhoto",
            Self::Document => "sendDocument",
        }
    }

    pub fn part_name(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Document => "document",
        }
    }
}

pub trait MediaStorage {
    fn provider(&self) -> &str;

    /// Sends one local file into the destination (forum topic).
    fn send_media<'a>(
        &'a self,
        file: &'a Path,
        destination_id: &'a str,
        mode: TransferMode,
    ) -> BoxFuture<'a, Result<()>>;

    /// Uploads an in-memory document to the chat root and returns its remote file id.
    fn upload_document<'a>(
        &'a self,
        filename: &'a str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, Result<String>>;

    fn download_document<'a>(&'a self, object_id: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone)]
pub struct TelegramBotApiConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
}

pub struct TelegramBotApi {
    config: TelegramBotApiConfig,
    client: reqwest::Client,
}

impl TelegramBotApi {
    pub fn new(config: TelegramBotApiConfig) -> Result<Self> {
        if config.bot_token.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "telegram bot token is empty".to_string(),
            });
        }
        if config.chat_id.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "telegram chat_id is empty".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(TELEGRAM_CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(TELEGRAM_READ_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self { config, client })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            file_path
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let res = request
            .send()
            .await
            .map_err(|e| Error::from_transport(&format!("{method} request failed"), e))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| Error::from_transport(&format!("{method} read response failed"), e))?;

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Network {
                message: format!("{method} http {status}: {}", describe_body(&body)),
            });
        }

        let parsed: TelegramResponse<T> =
            serde_json::from_str(&body).map_err(|e| Error::Telegram {
                message: format!("{method} invalid json: {e}; http {status}"),
            })?;

        if !parsed.ok {
            return Err(Error::Telegram {
                message: parsed
                    .description
                    .unwrap_or_else(|| format!("{method} returned ok=false (http {status})")),
            });
        }

        parsed.result.ok_or_else(|| Error::Telegram {
            message: format!("{method} missing result"),
        })
    }
}

impl MediaStorage for TelegramBotApi {
    fn provider(&self) -> &str {
        "telegram.botapi"
    }

    fn send_media<'a>(
        &'a self,
        file: &'a Path,
        destination_id: &'a str,
        mode: TransferMode,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(file).await?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file")
                .to_string();
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str(mime_for_path(file))
                .map_err(|e| Error::Telegram {
                    message: format!("invalid mime: {e}"),
                })?;
            let form = reqwest::multipart::Form::new()
                .text("chat_id", self.config.chat_id.clone())
                .text("message_thread_id", destination_id.to_string())
                .part(mode.part_name(), part);

            let method = mode.method();
            let request = self.client.post(self.method_url(method)).multipart(form);
            let _: TelegramMessage = self.call(method, request).await?;
            Ok(())
        })
    }

    fn upload_document<'a>(
        &'a self,
        filename: &'a str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(filename.to_string())
                .mime_str(mime_for_path(Path::new(filename)))
                .map_err(|e| Error::Telegram {
                    message: format!("invalid mime: {e}"),
                })?;
            let form = reqwest::multipart::Form::new()
                .text("chat_id", self.config.chat_id.clone())
                .part("document", part);

            let request = self
                .client
                .post(self.method_url("sendDocument"))
                .multipart(form);
            let message: TelegramMessage = self.call("sendDocument", request).await?;
            let document = message.document.ok_or_else(|| Error::Telegram {
                message: "missing result.document".to_string(),
            })?;
            Ok(document.file_id)
        })
    }

    fn download_document<'a>(&'a self, object_id: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.method_url("getFile"))
                .query(&[("file_id", object_id)]);
            let file: TelegramFile = self.call("getFile", request).await?;
            let file_path = file.file_path.ok_or_else(|| Error::Telegram {
                message: "getFile missing result.file_path".to_string(),
            })?;

            let res = self
                .client
                .get(self.file_url(&file_path))
                .send()
                .await
                .map_err(|e| Error::from_transport("file download failed", e))?;
            let status = res.status();
            let bytes = res
                .bytes()
                .await
                .map_err(|e| Error::from_transport("file download read failed", e))?;
            if status.is_server_error() {
                return Err(Error::Network {
                    message: format!("file download http {status}"),
                });
            }
            if !status.is_success() {
                return Err(Error::Telegram {
                    message: format!("file download http {status}"),
                });
            }
            Ok(bytes.to_vec())
        })
    }
}

impl RegistryStore for TelegramBotApi {
    fn fetch_registry(&self) -> BoxFuture<'_, Result<TopicRegistry>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.method_url("getChat"))
                .query(&[("chat_id", self.config.chat_id.as_str())]);
            let chat: TelegramChat = self.call("getChat", request).await?;
            let text = chat.pinned_message.and_then(|m| m.text).unwrap_or_default();
            match TopicRegistry::decode(&text) {
                Some(registry) => Ok(registry),
                None => {
                    if !text.is_empty() {
                        tracing::warn!(
                            event = "registry.pinned_not_registry",
                            "ignoring pinned message: not a registry"
                        );
                    }
                    Ok(TopicRegistry::new())
                }
            }
        })
    }

    fn save_registry<'a>(&'a self, registry: &'a TopicRegistry) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let text = registry.encode()?;
            let request = self.client.post(self.method_url("sendMessage")).form(&[
                ("chat_id", self.config.chat_id.as_str()),
                ("text", text.as_str()),
            ]);
            let message: TelegramMessage = self.call("sendMessage", request).await?;

            let message_id = message.message_id.to_string();
            let request = self.client.get(self.method_url("pinChatMessage")).query(&[
                ("chat_id", self.config.chat_id.as_str()),
                ("message_id", message_id.as_str()),
                ("disable_notification", "true"),
            ]);
            let _: bool = self.call("pinChatMessage", request).await?;
            Ok(())
        })
    }

    fn create_topic<'a>(&'a self, folder_name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let name = topic_title(folder_name);
            let request = self.client.post(self.method_url("createForumTopic")).form(&[
                ("chat_id", self.config.chat_id.as_str()),
                ("name", name.as_str()),
            ]);
            let topic: TelegramForumTopic = self.call("createForumTopic", request).await?;
            Ok(topic.message_thread_id.to_string())
        })
    }
}

pub fn topic_title(folder_name: &str) -> String {
    format!("📁 {folder_name}")
}

fn describe_body(body: &str) -> String {
    serde_json::from_str::<TelegramResponse<serde_json::Value>>(body)
        .ok()
        .and_then(|r| r.description)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    document: Option<TelegramDocument>,
}

#[derive(Debug, Deserialize)]
struct TelegramDocument {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    pinned_message: Option<TelegramPinnedMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramPinnedMessage {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramForumTopic {
    message_thread_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMedia {
    pub file_name: String,
    pub destination_id: String,
    pub mode: TransferMode,
}

/// Test double for the whole remote side: media uploads, documents, and the pinned registry.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    send_delay: Duration,
    offline: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    topics_created: AtomicUsize,
    registry_saves: AtomicUsize,
    document_uploads: AtomicUsize,
    attempts: Mutex<Vec<SentMedia>>,
    delivered: Mutex<Vec<SentMedia>>,
    rejected: Mutex<HashMap<TransferMode, HashSet<String>>>,
    documents: Mutex<HashMap<String, Vec<u8>>>,
    pinned: Mutex<Option<String>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `send_media` call sleeps this long, to make overlapping runs observable.
    pub fn with_send_delay(delay: Duration) -> Self {
        Self {
            send_delay: delay,
            ..Self::default()
        }
    }

    /// While offline every call fails with a transient network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes `mode` reject the named file with a bot-API style description.
    pub async fn reject(&self, mode: TransferMode, file_name: &str) {
        self.rejected
            .lock()
            .await
            .entry(mode)
            .or_default()
            .insert(file_name.to_string());
    }

    pub async fn set_pinned_text(&self, text: &str) {
        *self.pinned.lock().await = Some(text.to_string());
    }

    pub async fn pinned_text(&self) -> Option<String> {
        self.pinned.lock().await.clone()
    }

    pub async fn attempts(&self) -> Vec<SentMedia> {
        self.attempts.lock().await.clone()
    }

    pub async fn delivered(&self) -> Vec<SentMedia> {
        self.delivered.lock().await.clone()
    }

    pub async fn document(&self, object_id: &str) -> Option<Vec<u8>> {
        self.documents.lock().await.get(object_id).cloned()
    }

    pub fn topics_created(&self) -> usize {
        self.topics_created.load(Ordering::SeqCst)
    }

    pub fn registry_saves(&self) -> usize {
        self.registry_saves.load(Ordering::SeqCst)
    }

    pub fn document_uploads(&self) -> usize {
        self.document_uploads.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network {
                message: "connect timeout".to_string(),
            });
        }
        Ok(())
    }
}

impl MediaStorage for InMemoryRemote {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn send_media<'a>(
        &'a self,
        file: &'a Path,
        destination_id: &'a str,
        mode: TransferMode,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_online()?;
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let sent = SentMedia {
                file_name: file_name.clone(),
                destination_id: destination_id.to_string(),
                mode,
            };
            self.attempts.lock().await.push(sent.clone());

            let rejected = self
                .rejected
                .lock()
                .await
                .get(&mode)
                .is_some_and(|names| names.contains(&file_name));
            if rejected {
                return Err(Error::Telegram {
                    message: format!("Bad Request: {} rejected {file_name}", mode.method()),
                });
            }
            self.delivered.lock().await.push(sent);
            Ok(())
        })
    }

    fn upload_document<'a>(
        &'a self,
        _filename: &'a str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.check_online()?;
            let object_id = format!("mem:{}", uuid::Uuid::new_v4());
            self.documents.lock().await.insert(object_id.clone(), bytes);
            self.document_uploads.fetch_add(1, Ordering::SeqCst);
            Ok(object_id)
        })
    }

    fn download_document<'a>(&'a self, object_id: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.check_online()?;
            self.documents
                .lock()
                .await
                .get(object_id)
                .cloned()
                .ok_or_else(|| Error::Telegram {
                    message: format!("Bad Request: file not found: {object_id}"),
                })
        })
    }
}

impl RegistryStore for InMemoryRemote {
    fn fetch_registry(&self) -> BoxFuture<'_, Result<TopicRegistry>> {
        Box::pin(async move {
            self.check_online()?;
            let pinned = self.pinned.lock().await.clone().unwrap_or_default();
            Ok(TopicRegistry::decode(&pinned).unwrap_or_default())
        })
    }

    fn save_registry<'a>(&'a self, registry: &'a TopicRegistry) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let text = registry.encode()?;
            self.check_online()?;
            *self.pinned.lock().await = Some(text);
            self.registry_saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn create_topic<'a>(&'a self, _folder_name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.check_online()?;
            let n = self.topics_created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((100 + n).to_string())
        })
    }
}
