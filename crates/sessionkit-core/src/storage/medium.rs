use std::path::PathBuf;

use serde::{de::DeserializeOwned, Serialize};

use super::StorageError;

/// Where a backend keeps its snapshot.
#[derive(Debug, Clone)]
pub(crate) enum Medium {
    /// Nothing is persisted; the in-memory copy is all there is
    Memory,
    /// A single JSON file holding the whole snapshot
    File(PathBuf),
    /// The host disabled this storage
    Disabled,
}

impl Medium {
    pub fn is_available(&self) -> bool {
        !matches!(self, Medium::Disabled)
    }

    /// Load the snapshot. A missing file is `None`, not an error.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        match self {
            Medium::Memory => Ok(None),
            Medium::Disabled => Err(StorageError::Unavailable),
            Medium::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    pub async fn store<T: Serialize>(&self, value: &T) -> Result<(), StorageError> {
        match self {
            Medium::Memory => Ok(()),
            Medium::Disabled => Err(StorageError::Unavailable),
            Medium::File(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let contents = serde_json::to_string(value)?;
                tokio::fs::write(path, contents).await?;
                Ok(())
            }
        }
    }
}
