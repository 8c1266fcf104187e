//! Folder-name → destination-id map persisted remotely as one pinned text message.
//!
//! Wire format: `PHOTOGRAM_REGISTRY:` followed by a JSON object. The whole message must fit in
//! [`REGISTRY_MAX_CHARS`]; a registry that outgrows it cannot be saved at all.
//!
//! Keys are folder *names*, not paths: `/a/Camera` and `/b/Camera` share one destination.

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::storage::BoxFuture;
use crate::{Error, Result};

pub const REGISTRY_MARKER: &str = "PHOTOGRAM_REGISTRY:";
pub const REGISTRY_MAX_CHARS: usize = 4000;
/// Reserved key holding the remote file id of the latest ledger export.
pub const HISTORY_POINTER_KEY: &str = "CLOUD_HISTORY_ID";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRegistry {
    entries: BTreeMap<String, String>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, folder_name: &str) -> Option<&str> {
        self.entries.get(folder_name).map(String::as_str)
    }

    pub fn insert(&mut self, folder_name: impl Into<String>, destination_id: impl Into<String>) {
        self.entries
            .insert(folder_name.into(), destination_id.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folder entries, without the history pointer.
    pub fn folders(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(|(k, _)| k.as_str() != HISTORY_POINTER_KEY)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn history_pointer(&self) -> Option<&str> {
        self.get(HISTORY_POINTER_KEY).filter(|v| !v.is_empty())
    }

    pub fn set_history_pointer(&mut self, file_id: impl Into<String>) {
        self.insert(HISTORY_POINTER_KEY, file_id);
    }

    /// Serializes to the pinned-message text, refusing anything over the size bound.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(&self.entries)?;
        let text = format!("{REGISTRY_MARKER}{json}");
        // The host counts message length in UTF-16 code units.
        let len = text.encode_utf16().count();
        if len > REGISTRY_MAX_CHARS {
            return Err(Error::RegistryTooLarge {
                len,
                max: REGISTRY_MAX_CHARS,
            });
        }
        Ok(text)
    }

    /// Parses pinned-message text. Returns `None` for text that is not a registry.
    pub fn decode(text: &str) -> Option<Self> {
        let json = text.strip_prefix(REGISTRY_MARKER)?;
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json).ok()?;
        let entries = raw
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                serde_json::Value::Number(n) => Some((k, n.to_string())),
                _ => None,
            })
            .collect();
        Some(Self { entries })
    }
}

impl FromIterator<(String, String)> for TopicRegistry {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Remote persistence for the registry plus destination allocation.
///
/// `save_registry` must check the size bound before touching the network and must replace the
/// previous pin.
pub trait RegistryStore {
    fn fetch_registry(&self) -> BoxFuture<'_, Result<TopicRegistry>>;

    fn save_registry<'a>(&'a self, registry: &'a TopicRegistry) -> BoxFuture<'a, Result<()>>;

    fn create_topic<'a>(&'a self, folder_name: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Caches the registry and serializes every fetch-check-create-persist sequence so two callers
/// in one process never allocate two destinations for the same folder name.
pub struct RegistryClient<S> {
    store: S,
    cache: Mutex<Option<TopicRegistry>>,
}

impl<S: RegistryStore> RegistryClient<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Re-reads the remote registry and replaces the cache.
    pub async fn fetch(&self) -> Result<TopicRegistry> {
        let mut guard = self.cache.lock().await;
        let registry = self.store.fetch_registry().await?;
        debug!(
            event = "registry.fetch",
            entries = registry.len() as u64,
            "registry.fetch"
        );
        *guard = Some(registry.clone());
        Ok(registry)
    }

    /// Cached registry, fetching it on first use.
    pub async fn current(&self) -> Result<TopicRegistry> {
        let mut guard = self.cache.lock().await;
        if let Some(r) = guard.as_ref() {
            return Ok(r.clone());
        }
        let registry = self.store.fetch_registry().await?;
        *guard = Some(registry.clone());
        Ok(registry)
    }

    pub async fn resolve_destination(&self, folder_name: &str) -> Result<String> {
        let mut guard = self.cache.lock().await;
        let current = match guard.take() {
            Some(r) => r,
            None => self.store.fetch_registry().await?,
        };

        if let Some(id) = current.get(folder_name).map(str::to_string) {
            *guard = Some(current);
            return Ok(id);
        }

        let destination_id = self.store.create_topic(folder_name).await?;
        let mut next = current.clone();
        next.insert(folder_name, destination_id.clone());
        // Keep the last known-good registry cached if persisting fails.
        *guard = Some(current);
        self.store.save_registry(&next).await?;
        *guard = Some(next);

        info!(
            event = "registry.topic_created",
            folder_name,
            destination_id = %destination_id,
            "registry.topic_created"
        );
        Ok(destination_id)
    }

    pub async fn set_history_pointer(&self, file_id: &str) -> Result<()> {
        let mut guard = self.cache.lock().await;
        let current = match guard.take() {
            Some(r) => r,
            None => self.store.fetch_registry().await?,
        };
        let mut next = current.clone();
        next.set_history_pointer(file_id);
        *guard = Some(current);
        self.store.save_registry(&next).await?;
        *guard = Some(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryRemote;

    #[test]
    fn encode_is_marker_plus_json_object() {
        let mut reg = TopicRegistry::new();
        reg.insert("Folder1", "12345");
        reg.insert("Folder2", "67890");

        let text = reg.encode().unwrap();
        assert_eq!(
            text,
            r#"PHOTOGRAM_REGISTRY:{"Folder1":"12345","Folder2":"67890"}"#
        );
        assert_eq!(TopicRegistry::decode(&text), Some(reg));
    }

    #[test]
    fn decode_ignores_foreign_pins_and_accepts_numeric_ids() {
        assert_eq!(TopicRegistry::decode("hello group"), None);
        assert_eq!(TopicRegistry::decode("PHOTOGRAM_REGISTRY:not json"), None);

        let reg = TopicRegistry::decode(r#"PHOTOGRAM_REGISTRY:{"Camera":42}"#).unwrap();
        assert_eq!(reg.get("Camera"), Some("42"));
    }

    #[test]
    fn oversized_registry_is_rejected() {
        let reg = (0..200)
            .map(|i| (format!("Folder_{i}"), format!("thread_id_{i}")))
            .collect::<TopicRegistry>();

        match reg.encode() {
            Err(Error::RegistryTooLarge { len, max }) => {
                assert!(len > max);
                assert_eq!(max, REGISTRY_MAX_CHARS);
            }
            other => panic!("expected RegistryTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn history_pointer_is_not_a_folder() {
        let mut reg = TopicRegistry::new();
        reg.insert("Camera", "7");
        reg.set_history_pointer("file-abc");

        assert_eq!(reg.history_pointer(), Some("file-abc"));
        assert_eq!(reg.folders().collect::<Vec<_>>(), vec![("Camera", "7")]);
    }

    #[tokio::test]
    async fn oversized_save_never_reaches_the_network() {
        let remote = InMemoryRemote::new();
        let reg = (0..200)
            .map(|i| (format!("Folder_{i}"), format!("thread_id_{i}")))
            .collect::<TopicRegistry>();

        let err = remote.save_registry(&reg).await.unwrap_err();
        assert!(matches!(err, Error::RegistryTooLarge { .. }));
        assert_eq!(remote.registry_saves(), 0);
        assert_eq!(remote.pinned_text().await, None);
    }

    #[tokio::test]
    async fn resolve_creates_once_per_folder_name() {
        let client = RegistryClient::new(InMemoryRemote::new());

        let first = client.resolve_destination("Camera").await.unwrap();
        let again = client.resolve_destination("Camera").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(client.store().topics_created(), 1);

        let pinned = client.store().pinned_text().await.unwrap();
        let reg = TopicRegistry::decode(&pinned).unwrap();
        assert_eq!(reg.get("Camera"), Some(first.as_str()));
    }

    #[tokio::test]
    async fn concurrent_resolves_share_one_topic() {
        let client = RegistryClient::new(InMemoryRemote::new());

        let (a, b) = tokio::join!(
            client.resolve_destination("Screenshots"),
            client.resolve_destination("Screenshots")
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(client.store().topics_created(), 1);
    }
}
