use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use super::medium::Medium;
use super::{absorb, Storage, StorageError};
use crate::clock::Clock;
use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub value: String,
    /// None marks a session cookie, which is never written to disk
    pub expires: Option<DateTime<Utc>>,
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
}

impl Cookie {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    pub fn is_persistent(&self) -> bool {
        self.expires.is_some()
    }
}

/// Per-write overrides of the jar's defaults.
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub expires: Option<DateTime<Utc>>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: Option<bool>,
}

type Jar = HashMap<String, Cookie>;

/// Cookie jar storage.
///
/// Values are stored as JSON text inside the cookie. Persistent cookies are
/// mirrored to the medium; session cookies live only in this process.
pub struct CookieStorage {
    medium: Medium,
    jar: Mutex<Option<Jar>>,
    secure: bool,
    domain: Option<String>,
    path: String,
    secure_context: bool,
    clock: Arc<dyn Clock>,
}

impl CookieStorage {
    pub fn open(path: PathBuf, config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self::with_medium(Medium::File(path), config, clock)
    }

    pub fn memory(config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self::with_medium(Medium::Memory, config, clock)
    }

    pub fn disabled(config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self::with_medium(Medium::Disabled, config, clock)
    }

    fn with_medium(medium: Medium, config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            medium,
            jar: Mutex::new(None),
            secure: config.cookies.secure,
            domain: config.cookies.domain.clone(),
            path: config.cookies.path.clone(),
            secure_context: config.http.is_secure_context(),
            clock,
        }
    }

    /// Whether cookies with the default flags can be stored at all
    pub fn accepts_cookies(&self) -> bool {
        self.medium.is_available() && (!self.secure || self.secure_context)
    }

    /// Store a value with explicit cookie options
    pub async fn set_with_options(&self, key: &str, value: Value, options: CookieOptions) {
        absorb("cookie", "set", key, self.try_set(key, value, options).await)
    }

    /// The raw cookie, including its flags
    pub async fn cookie(&self, key: &str) -> Option<Cookie> {
        absorb("cookie", "get", key, self.try_cookie(key).await)
    }

    async fn loaded<'a>(&self, slot: &'a mut Option<Jar>) -> Result<&'a mut Jar, StorageError> {
        if slot.is_none() {
            let jar = match self.medium.load::<Jar>().await {
                Ok(jar) => jar.unwrap_or_default(),
                Err(StorageError::Serialization(e)) => {
                    warn!(error = %e, "Discarding unreadable cookie jar");
                    Jar::new()
                }
                Err(e) => return Err(e),
            };
            *slot = Some(jar);
        }
        let jar = slot.get_or_insert_with(HashMap::new);
        let now = self.clock.now();
        jar.retain(|_, cookie| !cookie.is_expired(now));
        Ok(jar)
    }

    async fn persist(&self, jar: &Jar) -> Result<(), StorageError> {
        let persistent: Jar = jar
            .iter()
            .filter(|(_, cookie)| cookie.is_persistent())
            .map(|(name, cookie)| (name.clone(), cookie.clone()))
            .collect();
        self.medium.store(&persistent).await
    }

    async fn try_cookie(&self, key: &str) -> Result<Option<Cookie>, StorageError> {
        let mut guard = self.jar.lock().await;
        let jar = self.loaded(&mut guard).await?;
        Ok(jar.get(key).cloned())
    }

    async fn try_get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.try_cookie(key).await?.map(|cookie| {
            serde_json::from_str(&cookie.value).unwrap_or(Value::String(cookie.value))
        }))
    }

    async fn try_set(&self, key: &str, value: Value, options: CookieOptions) -> Result<(), StorageError> {
        let secure = options.secure.unwrap_or(self.secure);
        if secure && !self.secure_context {
            return Err(StorageError::Rejected(
                "secure cookie in an insecure context".to_string(),
            ));
        }

        let cookie = Cookie {
            value: serde_json::to_string(&value)?,
            expires: options.expires,
            domain: options.domain.or_else(|| self.domain.clone()),
            path: options.path.unwrap_or_else(|| self.path.clone()),
            secure,
        };

        let mut guard = self.jar.lock().await;
        let jar = self.loaded(&mut guard).await?;
        let was_persistent = jar.get(key).is_some_and(Cookie::is_persistent);

        // An already-expired cookie is a deletion
        if cookie.is_expired(self.clock.now()) {
            jar.remove(key);
        } else {
            jar.insert(key.to_string(), cookie.clone());
        }

        if was_persistent || cookie.is_persistent() {
            self.persist(jar).await?;
        }
        Ok(())
    }

    async fn try_remove(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self.jar.lock().await;
        let jar = self.loaded(&mut guard).await?;
        if let Some(cookie) = jar.remove(key) {
            if cookie.is_persistent() {
                self.persist(jar).await?;
            }
        }
        Ok(())
    }

    async fn try_clear(&self) -> Result<(), StorageError> {
        if !self.medium.is_available() {
            return Err(StorageError::Unavailable);
        }
        let mut guard = self.jar.lock().await;
        let jar = guard.get_or_insert_with(HashMap::new);
        jar.clear();
        self.persist(jar).await
    }
}

#[async_trait]
impl Storage for CookieStorage {
    async fn get(&self, key: &str) -> Option<Value> {
        absorb("cookie", "get", key, self.try_get(key).await)
    }

    async fn set(&self, key: &str, value: Value) {
        self.set_with_options(key, value, CookieOptions::default()).await
    }

    async fn remove(&self, key: &str) {
        absorb("cookie", "remove", key, self.try_remove(key).await)
    }

    async fn clear(&self) {
        absorb("cookie", "clear", "*", self.try_clear().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use serde_json::json;

    fn insecure_config() -> Config {
        let mut config = Config::default();
        config.http.base_url = Some("http://localhost:8080".to_string());
        config
    }

    #[tokio::test]
    async fn test_expired_cookie_reads_as_absent() {
        let clock = Arc::new(ManualClock::default());
        let jar = CookieStorage::memory(&Config::default(), clock.clone());

        let options = CookieOptions {
            expires: Some(clock.now() + Duration::seconds(60)),
            ..Default::default()
        };
        jar.set_with_options("_token", json!("abc"), options).await;
        assert_eq!(jar.get("_token").await, Some(json!("abc")));

        clock.advance(Duration::seconds(60));
        assert_eq!(jar.get("_token").await, None);
    }

    #[tokio::test]
    async fn test_only_persistent_cookies_survive_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cookies.json");
        let clock = Arc::new(ManualClock::default());
        let config = Config::default();

        let jar = CookieStorage::open(path.clone(), &config, clock.clone());
        jar.set("session_only", json!("s")).await;
        let options = CookieOptions {
            expires: Some(clock.now() + Duration::days(30)),
            domain: Some("example.test".to_string()),
            ..Default::default()
        };
        jar.set_with_options("remembered", json!("r"), options).await;
        drop(jar);

        let restarted = CookieStorage::open(path, &config, clock);
        assert_eq!(restarted.get("session_only").await, None);
        assert_eq!(restarted.get("remembered").await, Some(json!("r")));

        let cookie = restarted.cookie("remembered").await.expect("cookie");
        assert_eq!(cookie.domain.as_deref(), Some("example.test"));
        assert_eq!(cookie.path, "/");
        assert!(cookie.secure);
    }

    #[tokio::test]
    async fn test_secure_cookie_rejected_in_insecure_context() {
        let config = insecure_config();
        let jar = CookieStorage::memory(&config, Arc::new(ManualClock::default()));
        assert!(!jar.accepts_cookies());

        jar.set("_token", json!("abc")).await;
        assert_eq!(jar.get("_token").await, None);

        let options = CookieOptions {
            secure: Some(false),
            ..Default::default()
        };
        jar.set_with_options("_token", json!("abc"), options).await;
        assert_eq!(jar.get("_token").await, Some(json!("abc")));
    }

    #[tokio::test]
    async fn test_past_expiry_deletes_cookie() {
        let clock = Arc::new(ManualClock::default());
        let jar = CookieStorage::memory(&Config::default(), clock.clone());
        jar.set("k", json!(1)).await;

        let options = CookieOptions {
            expires: Some(clock.now() - Duration::seconds(1)),
            ..Default::default()
        };
        jar.set_with_options("k", json!(1), options).await;
        assert_eq!(jar.get("k").await, None);
    }

    #[tokio::test]
    async fn test_disabled_jar() {
        let jar = CookieStorage::disabled(&Config::default(), Arc::new(ManualClock::default()));
        assert!(!jar.accepts_cookies());
        jar.set("k", json!(1)).await;
        assert_eq!(jar.get("k").await, None);
    }
}
