//! Credential storage.
//!
//! This module provides:
//! - `Token`: reads and writes the opaque credential in the active driver
//! - rotation: backup of the credential into the durable store when the
//!   host signals an unload, and one-shot pickup on the next start
//!
//! The credential is an opaque string; nothing here inspects or verifies it.

mod rotation;

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{Config, TokenConfig};
use crate::storage::{CookieOptions, Driver, Storage, Storages};

pub use rotation::MANIFEST_KEY;

/// Field holding a refresh credential in server responses
const REFRESH_FIELD: &str = "refresh_token";

/// Field some servers nest the credential under
const NESTED_FIELD: &str = "token";

/// Overrides for a single `Token::set_with` call.
#[derive(Debug, Clone, Default)]
pub struct TokenOptions {
    /// Storage key; defaults to the configured token key
    pub key: Option<String>,
    /// Expiry, honoured by the cookie driver. None stores a session credential.
    pub expiry: Option<DateTime<Utc>>,
    /// Backend to write to; defaults to the active driver
    pub driver: Option<Driver>,
}

pub struct Token {
    config: TokenConfig,
    rotation_enabled: bool,
    storages: Storages,
    driver: RwLock<Driver>,
    /// Keys written through this store and the backend each went to, in
    /// write order
    tracked: Mutex<Vec<(String, Driver)>>,
}

impl Token {
    /// Create the store and pick up any credential rotated by a previous run.
    pub async fn init(config: &Config, storages: Storages) -> Self {
        let token = Self {
            config: config.token.clone(),
            rotation_enabled: config.rotation_enabled(),
            storages,
            driver: RwLock::new(config.token.driver),
            tracked: Mutex::new(Vec::new()),
        };
        token.pick_up().await;
        token
    }

    pub fn driver(&self) -> Driver {
        *self.driver.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Switch the backend used by subsequent operations
    pub fn set_driver(&self, driver: Driver) {
        debug!(driver = %driver, "Switching token driver");
        *self.driver.write().unwrap_or_else(|e| e.into_inner()) = driver;
    }

    /// The configured key of the access credential
    pub fn key(&self) -> &str {
        &self.config.key
    }

    pub fn refresh_key(&self) -> &str {
        &self.config.refresh_key
    }

    pub fn storages(&self) -> &Storages {
        &self.storages
    }

    /// Keys currently tracked for rotation
    pub fn tracked_keys(&self) -> Vec<String> {
        self.tracked().into_iter().map(|(key, _)| key).collect()
    }

    fn tracked(&self) -> Vec<(String, Driver)> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record that `key` now lives in `driver`
    fn track(&self, key: &str, driver: Driver) {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        match tracked.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = driver,
            None => tracked.push((key.to_string(), driver)),
        }
    }

    fn untrack(&self, key: &str, driver: Driver) {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(k, d)| !(k == key && *d == driver));
    }

    /// Store the access credential in the active driver
    pub async fn set(&self, value: &str) {
        self.set_with(value, TokenOptions::default()).await
    }

    pub async fn set_with(&self, value: &str, options: TokenOptions) {
        let key = options.key.unwrap_or_else(|| self.config.key.clone());
        let driver = options.driver.unwrap_or_else(|| self.driver());
        let value = Value::String(value.to_string());

        match driver {
            Driver::Cookie => {
                let cookie_options = CookieOptions {
                    expires: options.expiry,
                    ..Default::default()
                };
                self.storages.cookie.set_with_options(&key, value, cookie_options).await;
            }
            other => {
                if options.expiry.is_some() {
                    debug!(driver = %other, "Expiry only applies to the cookie driver");
                }
                self.storages.backend(other).set(&key, value).await;
            }
        }

        self.track(&key, driver);
    }

    /// The access credential from the active driver
    pub async fn get(&self) -> Option<String> {
        self.get_key(&self.config.key).await
    }

    pub async fn get_key(&self, key: &str) -> Option<String> {
        self.get_with(key, self.driver()).await
    }

    pub async fn get_with(&self, key: &str, driver: Driver) -> Option<String> {
        match self.storages.backend(driver).get(key).await? {
            Value::String(token) if !token.is_empty() => Some(token),
            Value::Null | Value::String(_) => None,
            other => {
                debug!(key, kind = ?other, "Ignoring non-string credential");
                None
            }
        }
    }

    pub async fn remove(&self) {
        self.remove_key(&self.config.key).await
    }

    /// Delete a credential from the active driver
    pub async fn remove_key(&self, key: &str) {
        let driver = self.driver();
        self.storages.backend(driver).remove(key).await;
        self.untrack(key, driver);
    }

    /// Extract the access credential from a response payload.
    ///
    /// Looks at the configured field, then the same field inside a nested
    /// `token` object, then a bare `token` string.
    pub fn read(&self, payload: &Value) -> Option<String> {
        read_field(payload, &self.config.field).or_else(|| {
            payload
                .get(NESTED_FIELD)
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
        })
    }

    /// Extract a refresh credential from a response payload
    pub fn read_refresh(&self, payload: &Value) -> Option<String> {
        read_field(payload, REFRESH_FIELD)
    }

    /// Remove every credential from every backend.
    ///
    /// Best-effort: a failing backend is logged by the adapter and the rest
    /// are still cleared.
    pub async fn destroy(&self) {
        let mut keys = self.tracked_keys();
        for key in [&self.config.key, &self.config.refresh_key] {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let removals = Driver::ALL.into_iter().flat_map(|driver| {
            let backend = self.storages.backend(driver);
            keys.iter().map(move |key| backend.remove(key))
        });
        join_all(removals).await;

        self.discard_rotation(&keys).await;
        self.tracked.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!(keys = keys.len(), "Destroyed credentials in all backends");
    }

    /// Run the rotation backup once `signal` resolves.
    ///
    /// `signal` is whatever the host uses for teardown: a shutdown channel,
    /// a ctrl-c future, a window close hook.
    pub fn watch_unload<F>(self: &Arc<Self>, signal: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = Arc::clone(self);
        tokio::spawn(async move {
            signal.await;
            token.on_unload().await;
        })
    }
}

fn read_field(payload: &Value, field: &str) -> Option<String> {
    let direct = payload.get(field);
    let nested = || payload.get(NESTED_FIELD).and_then(|token| token.get(field));
    direct
        .and_then(Value::as_str)
        .or_else(|| nested().and_then(Value::as_str))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
