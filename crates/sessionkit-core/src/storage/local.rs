use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use super::medium::Medium;
use super::{absorb, Storage, StorageError};

type Entries = HashMap<String, Value>;

/// Durable key/value storage backed by a single JSON file.
///
/// The file is read on first access and rewritten after every mutation.
pub struct LocalStorage {
    medium: Medium,
    entries: Mutex<Option<Entries>>,
}

impl LocalStorage {
    pub fn open(path: PathBuf) -> Self {
        Self::with_medium(Medium::File(path))
    }

    /// Not persisted; useful for tests and hosts without a writable disk
    pub fn memory() -> Self {
        Self::with_medium(Medium::Memory)
    }

    pub fn disabled() -> Self {
        Self::with_medium(Medium::Disabled)
    }

    fn with_medium(medium: Medium) -> Self {
        Self {
            medium,
            entries: Mutex::new(None),
        }
    }

    async fn loaded<'a>(&self, slot: &'a mut Option<Entries>) -> Result<&'a mut Entries, StorageError> {
        if slot.is_none() {
            let entries = match self.medium.load::<Entries>().await {
                Ok(entries) => entries.unwrap_or_default(),
                Err(StorageError::Serialization(e)) => {
                    warn!(error = %e, "Discarding unreadable local storage file");
                    Entries::new()
                }
                Err(e) => return Err(e),
            };
            *slot = Some(entries);
        }
        Ok(slot.get_or_insert_with(HashMap::new))
    }

    async fn try_get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut guard = self.entries.lock().await;
        let entries = self.loaded(&mut guard).await?;
        Ok(entries.get(key).cloned())
    }

    async fn try_set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut guard = self.entries.lock().await;
        let entries = self.loaded(&mut guard).await?;
        entries.insert(key.to_string(), value);
        self.medium.store(entries).await
    }

    async fn try_remove(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self.entries.lock().await;
        let entries = self.loaded(&mut guard).await?;
        if entries.remove(key).is_some() {
            self.medium.store(entries).await?;
        }
        Ok(())
    }

    async fn try_clear(&self) -> Result<(), StorageError> {
        if !self.medium.is_available() {
            return Err(StorageError::Unavailable);
        }
        let mut guard = self.entries.lock().await;
        let entries = guard.get_or_insert_with(HashMap::new);
        entries.clear();
        self.medium.store(entries).await
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get(&self, key: &str) -> Option<Value> {
        absorb("local", "get", key, self.try_get(key).await)
    }

    async fn set(&self, key: &str, value: Value) {
        absorb("local", "set", key, self.try_set(key, value).await)
    }

    async fn remove(&self, key: &str) {
        absorb("local", "remove", key, self.try_remove(key).await)
    }

    async fn clear(&self) {
        absorb("local", "clear", "*", self.try_clear().await)
    }
}
