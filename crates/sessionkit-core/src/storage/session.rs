use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{absorb, Storage, StorageError};

/// Per-process ephemeral storage. Dropped with the process, like a tab's
/// session storage.
#[derive(Debug, Default)]
pub struct SessionStorage {
    entries: RwLock<HashMap<String, Value>>,
    disabled: bool,
}

impl SessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session storage the host has switched off
    pub fn disabled() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            disabled: true,
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.disabled {
            Err(StorageError::Unavailable)
        } else {
            Ok(())
        }
    }

    async fn try_get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.check()?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn try_set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.check()?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn try_remove(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl Storage for SessionStorage {
    async fn get(&self, key: &str) -> Option<Value> {
        absorb("session", "get", key, self.try_get(key).await)
    }

    async fn set(&self, key: &str, value: Value) {
        absorb("session", "set", key, self.try_set(key, value).await)
    }

    async fn remove(&self, key: &str) {
        absorb("session", "remove", key, self.try_remove(key).await)
    }

    async fn clear(&self) {
        if self.check().is_ok() {
            self.entries.write().await.clear();
        }
    }
}
