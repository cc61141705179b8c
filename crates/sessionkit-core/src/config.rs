//! Session configuration management.
//!
//! This module handles loading and saving the configuration read by the
//! token store, cache, HTTP layer and authentication orchestrator.
//!
//! Configuration is stored at `~/.config/sessionkit/config.json`. Every
//! field has a default, so a partial (or missing) file is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::storage::Driver;

/// Application name used for config/data directory paths
const APP_NAME: &str = "sessionkit";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Log full error bodies from the HTTP layer
    pub debug: bool,
    pub token: TokenConfig,
    pub cookies: CookieConfig,
    pub http: HttpConfig,
    pub authentication: AuthenticationConfig,
    pub cache: CacheConfig,
    /// Directory for the durable backends. Defaults to the platform data dir.
    pub storage_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Field holding the credential in server responses
    pub field: String,
    /// Storage key of the access credential
    pub key: String,
    /// Storage key of the refresh credential
    pub refresh_key: String,
    /// Authorization header scheme, e.g. "Bearer"
    pub scheme: Option<String>,
    pub driver: Driver,
    pub rotate_cookies: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            field: "access_token".to_string(),
            key: "_token".to_string(),
            refresh_key: "_refresh_token".to_string(),
            scheme: Some("Bearer".to_string()),
            driver: Driver::Cookie,
            rotate_cookies: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    pub secure: bool,
    pub domain: Option<String>,
    pub path: String,
    /// Lifetime of a remembered credential
    pub remember_days: i64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            secure: true,
            domain: None,
            path: "/".to_string(),
            remember_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: BTreeMap::new(),
            timeout_secs: 30,
        }
    }
}

impl HttpConfig {
    /// Whether cookies marked `secure` may be stored for this origin.
    /// Only a plain `http://` base URL makes the context insecure.
    pub fn is_secure_context(&self) -> bool {
        !self
            .base_url
            .as_deref()
            .is_some_and(|url| url.starts_with("http://"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    /// Attach the credential as an Authorization header
    pub method_token: bool,
    pub should_remember: bool,
    /// TTL of the cached user record; 0 never expires
    pub user_ttl_secs: u64,
    pub endpoints: Endpoints,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            method_token: true,
            should_remember: false,
            user_ttl_secs: 0,
            endpoints: Endpoints::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub check: String,
    pub login: String,
    pub logout: String,
    pub refresh: String,
    pub register: String,
    pub forgot_password: String,
    pub reset_password: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            check: "auth/user".to_string(),
            login: "auth/login".to_string(),
            logout: "auth/logout".to_string(),
            refresh: "auth/token".to_string(),
            register: "auth/register".to_string(),
            forgot_password: "auth/forgot-password".to_string(),
            reset_password: "auth/reset-password".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace of the cache snapshot in durable storage
    pub name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the durable backends (local, cookie jar, indexed store)
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.storage_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Whether tab-close rotation may run under the cookie security settings
    pub fn rotation_enabled(&self) -> bool {
        self.token.rotate_cookies && (!self.cookies.secure || self.http.is_secure_context())
    }
}
