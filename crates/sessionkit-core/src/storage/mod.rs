//! Key/value storage backends.
//!
//! Four interchangeable backends satisfy the same `Storage` contract:
//! - `SessionStorage`: in-process, lost when the process exits
//! - `LocalStorage`: a JSON map file, durable per data directory
//! - `CookieStorage`: a cookie jar with expiry, domain and secure flags
//! - `IndexedStore`: one JSON document per key, the durable rotation target
//!
//! A backend whose medium is unavailable (disabled, unreadable, full) never
//! fails the caller. Failures are logged and reads degrade to "absent".

pub mod cookie;
pub mod indexed;
pub mod local;
mod medium;
pub mod session;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::Config;

pub use cookie::{Cookie, CookieOptions, CookieStorage};
pub use indexed::IndexedStore;
pub use local::LocalStorage;
pub use session::SessionStorage;

/// Durable flag recording that a user is logged in. Written by the
/// authentication orchestrator, read by the token rotation logic.
pub const LOGGED_IN_KEY: &str = "logged_in";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend unavailable")]
    Unavailable,

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The capability set shared by every backend.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value);

    async fn remove(&self, key: &str);

    async fn clear(&self);
}

/// Log a backend failure and fall back to the default (absent / no-op).
pub(crate) fn absorb<T: Default>(
    backend: &'static str,
    op: &'static str,
    key: &str,
    result: Result<T, StorageError>,
) -> T {
    match result {
        Ok(value) => value,
        Err(StorageError::Unavailable) => {
            debug!(backend, op, key, "Storage backend unavailable");
            T::default()
        }
        Err(e) => {
            warn!(backend, op, key, error = %e, "Storage operation failed");
            T::default()
        }
    }
}

/// Backend selected for token operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    Session,
    Local,
    Cookie,
    Durable,
}

impl Driver {
    pub const ALL: [Driver; 4] = [Driver::Session, Driver::Local, Driver::Cookie, Driver::Durable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Session => "session",
            Driver::Local => "local",
            Driver::Cookie => "cookie",
            Driver::Durable => "durable",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "session" => Ok(Driver::Session),
            "local" => Ok(Driver::Local),
            "cookie" => Ok(Driver::Cookie),
            "durable" | "indexed" => Ok(Driver::Durable),
            other => Err(format!("Unknown storage driver: {}", other)),
        }
    }
}

/// The four backends, addressed by `Driver`.
/// Clone is cheap - every backend sits behind an Arc.
#[derive(Clone)]
pub struct Storages {
    pub session: Arc<SessionStorage>,
    pub local: Arc<LocalStorage>,
    pub cookie: Arc<CookieStorage>,
    pub durable: Arc<IndexedStore>,
}

impl Storages {
    /// Backends that live only as long as this value. Nothing touches disk.
    pub fn in_memory(config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            session: Arc::new(SessionStorage::new()),
            local: Arc::new(LocalStorage::memory()),
            cookie: Arc::new(CookieStorage::memory(config, clock)),
            durable: Arc::new(IndexedStore::memory()),
        }
    }

    /// Durable backends rooted at `dir`. Session storage and session
    /// cookies stay in memory.
    pub fn open(dir: &Path, config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            session: Arc::new(SessionStorage::new()),
            local: Arc::new(LocalStorage::open(dir.join("local.json"))),
            cookie: Arc::new(CookieStorage::open(dir.join("cookies.json"), config, clock)),
            durable: Arc::new(IndexedStore::open(dir.join("indexed"))),
        }
    }

    pub fn backend(&self, driver: Driver) -> &dyn Storage {
        match driver {
            Driver::Session => self.session.as_ref(),
            Driver::Local => self.local.as_ref(),
            Driver::Cookie => self.cookie.as_ref(),
            Driver::Durable => self.durable.as_ref(),
        }
    }

    /// Read the durable logged-in flag
    pub async fn logged_in(&self) -> bool {
        matches!(self.local.get(LOGGED_IN_KEY).await, Some(Value::Bool(true)))
    }

    pub async fn set_logged_in(&self, logged_in: bool) {
        self.local.set(LOGGED_IN_KEY, Value::Bool(logged_in)).await;
    }
}
