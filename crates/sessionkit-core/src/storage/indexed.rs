use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{absorb, Storage, StorageError};

/// Extension of every document the store writes
const DOCUMENT_EXT: &str = "json";

enum Backing {
    Memory(RwLock<HashMap<String, Value>>),
    Directory(PathBuf),
    Disabled,
}

/// Durable object store with one JSON document per key.
///
/// Unlike `LocalStorage` nothing is held in memory; every read goes to the
/// medium, so a second process sees writes immediately. This is the
/// backend token rotation writes its backup into.
pub struct IndexedStore {
    backing: Backing,
}

impl IndexedStore {
    pub fn open(dir: PathBuf) -> Self {
        Self {
            backing: Backing::Directory(dir),
        }
    }

    pub fn memory() -> Self {
        Self {
            backing: Backing::Memory(RwLock::new(HashMap::new())),
        }
    }

    pub fn disabled() -> Self {
        Self {
            backing: Backing::Disabled,
        }
    }

    /// File names are the url-safe base64 of the key, so any key is a valid name
    fn document_path(dir: &std::path::Path, key: &str) -> PathBuf {
        dir.join(format!("{}.{}", URL_SAFE_NO_PAD.encode(key), DOCUMENT_EXT))
    }

    async fn try_get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match &self.backing {
            Backing::Memory(entries) => Ok(entries.read().await.get(key).cloned()),
            Backing::Disabled => Err(StorageError::Unavailable),
            Backing::Directory(dir) => {
                match tokio::fs::read_to_string(Self::document_path(dir, key)).await {
                    Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn try_set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        match &self.backing {
            Backing::Memory(entries) => {
                entries.write().await.insert(key.to_string(), value);
                Ok(())
            }
            Backing::Disabled => Err(StorageError::Unavailable),
            Backing::Directory(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let contents = serde_json::to_string(&value)?;
                tokio::fs::write(Self::document_path(dir, key), contents).await?;
                Ok(())
            }
        }
    }

    async fn try_remove(&self, key: &str) -> Result<(), StorageError> {
        match &self.backing {
            Backing::Memory(entries) => {
                entries.write().await.remove(key);
                Ok(())
            }
            Backing::Disabled => Err(StorageError::Unavailable),
            Backing::Directory(dir) => match tokio::fs::remove_file(Self::document_path(dir, key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn try_clear(&self) -> Result<(), StorageError> {
        match &self.backing {
            Backing::Memory(entries) => {
                entries.write().await.clear();
                Ok(())
            }
            Backing::Disabled => Err(StorageError::Unavailable),
            Backing::Directory(dir) => {
                let mut documents = match tokio::fs::read_dir(dir).await {
                    Ok(documents) => documents,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = documents.next_entry().await? {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == DOCUMENT_EXT) {
                        tokio::fs::remove_file(path).await?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Storage for IndexedStore {
    async fn get(&self, key: &str) -> Option<Value> {
        absorb("durable", "get", key, self.try_get(key).await)
    }

    async fn set(&self, key: &str, value: Value) {
        absorb("durable", "set", key, self.try_set(key, value).await)
    }

    async fn remove(&self, key: &str) {
        absorb("durable", "remove", key, self.try_remove(key).await)
    }

    async fn clear(&self) {
        absorb("durable", "clear", "*", self.try_clear().await)
    }
}
