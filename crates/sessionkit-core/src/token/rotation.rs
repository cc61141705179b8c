//! Tab-close rotation of credentials into the durable store.
//!
//! On unload the tracked credential keys are copied (not moved) into the
//! durable indexed store together with a manifest listing them. Each key is
//! read from the backend it was written to. The next `Token::init` replays
//! the copies into the active driver and deletes both the manifest and the
//! copies, so a backup is consumed once.
//!
//! A copy of a persistent cookie carries its expiry, so a remembered login
//! is replayed as a persistent cookie and survives later restarts.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::Token;
use crate::storage::{CookieOptions, Driver, Storage};

/// Durable key of the rotation manifest
pub const MANIFEST_KEY: &str = "_sktk";

/// Durable key holding the backup of one rotated credential
fn copy_key(key: &str) -> String {
    format!("{}:{}", MANIFEST_KEY, key)
}

/// base64 of the JSON array of keys
fn encode_manifest(keys: &[String]) -> Result<String, serde_json::Error> {
    Ok(STANDARD.encode(serde_json::to_vec(keys)?))
}

fn decode_manifest(raw: &str) -> Option<Vec<String>> {
    let bytes = STANDARD.decode(raw).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// One rotated credential: `{"value": ..., "expires": "<rfc3339>"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Backup {
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires: Option<DateTime<Utc>>,
}

impl Backup {
    /// Copies written as a bare value carry no expiry
    fn parse(stored: Value) -> Self {
        if stored.get("value").is_some() {
            if let Ok(backup) = serde_json::from_value(stored.clone()) {
                return backup;
            }
        }
        Self {
            value: stored,
            expires: None,
        }
    }
}

impl Token {
    /// Back up the tracked credentials into the durable store.
    ///
    /// Does nothing unless rotation is enabled and the durable logged-in
    /// flag is set. The active driver is left as it is.
    pub async fn on_unload(&self) {
        if !self.rotation_enabled {
            return;
        }
        if !self.storages.logged_in().await {
            debug!("Not logged in, skipping credential rotation");
            return;
        }

        let durable = &self.storages.durable;
        let mut rotated = Vec::new();
        for (key, driver) in self.tracked() {
            let Some(value) = self.storages.backend(driver).get(&key).await else {
                continue;
            };
            let expires = match driver {
                Driver::Cookie => self.storages.cookie.cookie(&key).await.and_then(|c| c.expires),
                _ => None,
            };
            match serde_json::to_value(Backup { value, expires }) {
                Ok(backup) => {
                    durable.set(&copy_key(&key), backup).await;
                    rotated.push(key);
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to encode credential backup"),
            }
        }
        if rotated.is_empty() {
            return;
        }

        match encode_manifest(&rotated) {
            Ok(manifest) => {
                durable.set(MANIFEST_KEY, Value::String(manifest)).await;
                info!(keys = rotated.len(), "Rotated credentials into durable storage");
            }
            Err(e) => warn!(error = %e, "Failed to encode rotation manifest"),
        }
    }

    /// Replay a rotated backup into the active driver, then consume it.
    pub(super) async fn pick_up(&self) {
        if !self.rotation_enabled {
            return;
        }
        let durable = &self.storages.durable;
        let Some(raw) = durable.get(MANIFEST_KEY).await else {
            return;
        };
        let keys = raw.as_str().and_then(decode_manifest).unwrap_or_default();

        // A session that logged out before closing must not come back
        let restore = self.storages.logged_in().await;
        let target = self.driver();
        for key in &keys {
            let copy = copy_key(key);
            if restore {
                if let Some(stored) = durable.get(&copy).await {
                    self.restore(target, key, Backup::parse(stored)).await;
                }
            }
            durable.remove(&copy).await;
        }
        durable.remove(MANIFEST_KEY).await;

        if restore {
            info!(keys = keys.len(), driver = %target, "Picked up rotated credentials");
        } else {
            debug!("Discarded rotated credentials of a logged-out session");
        }
    }

    async fn restore(&self, driver: Driver, key: &str, backup: Backup) {
        match driver {
            Driver::Cookie => {
                let options = CookieOptions {
                    expires: backup.expires,
                    ..Default::default()
                };
                self.storages.cookie.set_with_options(key, backup.value, options).await;
            }
            other => self.storages.backend(other).set(key, backup.value).await,
        }
        self.track(key, driver);
    }

    /// Drop any pending backup of `keys` along with the manifest
    pub(super) async fn discard_rotation(&self, keys: &[String]) {
        let durable = &self.storages.durable;
        for key in keys {
            durable.remove(&copy_key(key)).await;
        }
        durable.remove(MANIFEST_KEY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::Config;
    use crate::storage::Storages;
    use crate::token::TokenOptions;
    use serde_json::json;
    use std::sync::Arc;

    fn rotating_config() -> Config {
        let mut config = Config::default();
        config.token.rotate_cookies = true;
        config.cookies.secure = false;
        config
    }

    #[test]
    fn test_manifest_encoding() {
        let keys = vec!["_token".to_string(), "_refresh_token".to_string()];
        let encoded = encode_manifest(&keys).expect("encode");
        assert_eq!(decode_manifest(&encoded), Some(keys));

        // Same layout as base64(JSON.stringify(["_token"]))
        assert_eq!(
            encode_manifest(&["_token".to_string()]).expect("encode"),
            "WyJfdG9rZW4iXQ=="
        );
        assert_eq!(decode_manifest("not base64!"), None);
    }

    #[tokio::test]
    async fn test_drops_off_token_on_unload() {
        let config = rotating_config();
        let storages = Storages::in_memory(&config, Arc::new(SystemClock));
        let token = Token::init(&config, storages.clone()).await;

        token.set("TEST_TOKEN").await;
        storages.set_logged_in(true).await;
        token.on_unload().await;

        assert_eq!(storages.durable.get("_sktk:_token").await, Some(json!({"value": "TEST_TOKEN"})));
        assert!(storages.durable.get(MANIFEST_KEY).await.is_some());
        // Rotation is a backup, not a move
        assert_eq!(token.get().await.as_deref(), Some("TEST_TOKEN"));
    }

    #[tokio::test]
    async fn test_no_drop_off_when_logged_out() {
        let config = rotating_config();
        let storages = Storages::in_memory(&config, Arc::new(SystemClock));
        let token = Token::init(&config, storages.clone()).await;

        storages.set_logged_in(false).await;
        token.set("TEST_TOKEN").await;
        token.on_unload().await;

        assert_eq!(storages.durable.get("_sktk:_token").await, None);
        assert_eq!(storages.durable.get(MANIFEST_KEY).await, None);
    }

    #[tokio::test]
    async fn test_no_drop_off_when_rotation_disabled() {
        let config = Config::default();
        let storages = Storages::in_memory(&config, Arc::new(SystemClock));
        let token = Token::init(&config, storages.clone()).await;

        storages.set_logged_in(true).await;
        token.set("TEST_TOKEN").await;
        token.on_unload().await;

        assert_eq!(storages.durable.get(MANIFEST_KEY).await, None);
    }

    #[tokio::test]
    async fn test_picks_up_token_on_init() {
        let config = rotating_config();
        let storages = Storages::in_memory(&config, Arc::new(SystemClock));
        storages.set_logged_in(true).await;
        storages
            .durable
            .set(MANIFEST_KEY, json!(encode_manifest(&["_token".to_string()]).expect("encode")))
            .await;
        storages.durable.set("_sktk:_token", json!("TEST_TOKEN")).await;

        let token = Token::init(&config, storages.clone()).await;

        assert_eq!(storages.durable.get(MANIFEST_KEY).await, None);
        assert_eq!(storages.durable.get("_sktk:_token").await, None);
        assert_eq!(token.get_key("_token").await.as_deref(), Some("TEST_TOKEN"));
        assert_eq!(token.tracked_keys(), vec!["_token".to_string()]);
    }

    #[tokio::test]
    async fn test_pickup_skipped_when_logged_out() {
        let config = rotating_config();
        let storages = Storages::in_memory(&config, Arc::new(SystemClock));
        storages.set_logged_in(false).await;
        storages
            .durable
            .set(MANIFEST_KEY, json!(encode_manifest(&["_token".to_string()]).expect("encode")))
            .await;
        storages.durable.set("_sktk:_token", json!("STALE")).await;

        let token = Token::init(&config, storages.clone()).await;

        assert_eq!(token.get().await, None);
        assert_eq!(storages.durable.get(MANIFEST_KEY).await, None);
        assert_eq!(storages.durable.get("_sktk:_token").await, None);
    }

    #[tokio::test]
    async fn test_no_pickup_without_manifest() {
        let config = rotating_config();
        let storages = Storages::in_memory(&config, Arc::new(SystemClock));
        storages.set_logged_in(true).await;
        storages.durable.set("_sktk:_token", json!("ORPHAN")).await;

        let token = Token::init(&config, storages).await;
        assert_eq!(token.get().await, None);
    }

    #[tokio::test]
    async fn test_unload_reads_each_key_from_its_driver() {
        let config = rotating_config();
        let storages = Storages::in_memory(&config, Arc::new(SystemClock));
        let token = Token::init(&config, storages.clone()).await;

        token.set("ACCESS").await;
        let options = TokenOptions {
            key: Some("_refresh_token".to_string()),
            driver: Some(Driver::Session),
            ..Default::default()
        };
        token.set_with("REFRESH", options).await;
        token.set_driver(Driver::Local);
        storages.set_logged_in(true).await;
        token.on_unload().await;

        assert_eq!(storages.durable.get("_sktk:_token").await, Some(json!({"value": "ACCESS"})));
        assert_eq!(
            storages.durable.get("_sktk:_refresh_token").await,
            Some(json!({"value": "REFRESH"}))
        );
        let manifest = storages.durable.get(MANIFEST_KEY).await.expect("manifest");
        assert_eq!(
            manifest.as_str().and_then(decode_manifest),
            Some(vec!["_token".to_string(), "_refresh_token".to_string()])
        );
    }

    #[tokio::test]
    async fn test_remembered_cookie_survives_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = rotating_config();
        let expiry = Utc::now() + chrono::Duration::days(30);

        {
            let storages = Storages::open(dir.path(), &config, Arc::new(SystemClock));
            let token = Token::init(&config, storages.clone()).await;
            let options = TokenOptions {
                expiry: Some(expiry),
                ..Default::default()
            };
            token.set_with("REMEMBERED", options).await;
            storages.set_logged_in(true).await;
            token.on_unload().await;
        }

        // Picks up the backup as a persistent cookie
        {
            let storages = Storages::open(dir.path(), &config, Arc::new(SystemClock));
            let token = Token::init(&config, storages.clone()).await;
            assert_eq!(token.get().await.as_deref(), Some("REMEMBERED"));
            let cookie = storages.cookie.cookie("_token").await.expect("cookie");
            assert_eq!(cookie.expires, Some(expiry));
        }

        // Closed without an unload: the cookie itself is still on disk
        let storages = Storages::open(dir.path(), &config, Arc::new(SystemClock));
        let token = Token::init(&config, storages).await;
        assert_eq!(token.get().await.as_deref(), Some("REMEMBERED"));
    }

    #[test]
    fn test_bare_backup_value_is_parsed() {
        assert_eq!(
            Backup::parse(json!("T")),
            Backup {
                value: json!("T"),
                expires: None
            }
        );
        let expiry = Utc::now();
        let stored = serde_json::to_value(Backup {
            value: json!("T"),
            expires: Some(expiry),
        })
        .expect("encode");
        assert_eq!(Backup::parse(stored).expires, Some(expiry));
    }
}
