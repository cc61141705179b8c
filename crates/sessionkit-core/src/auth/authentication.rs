use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::api::{ApiError, Http, Transport};
use crate::cache::Cache;
use crate::clock::Clock;
use crate::config::{AuthenticationConfig, Config};
use crate::events::{AuthEvent, Events};
use crate::storage::{Driver, Storages};
use crate::token::{Token, TokenOptions};

/// Cache key of the authenticated user record
pub const USER_CACHE_KEY: &str = "auth:user";

/// Field the refresh credential is sent under
const REFRESH_FIELD: &str = "refresh_token";

pub struct Authentication {
    config: AuthenticationConfig,
    remember_days: i64,
    token: Arc<Token>,
    cache: Arc<Cache>,
    http: Arc<Http>,
    events: Events,
    clock: Arc<dyn Clock>,
    authenticated: AtomicBool,
    remember: AtomicBool,
    redirect: Mutex<Option<String>>,
}

impl Authentication {
    pub fn new(
        config: &Config,
        token: Arc<Token>,
        cache: Arc<Cache>,
        http: Arc<Http>,
        events: Events,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: config.authentication.clone(),
            remember_days: config.cookies.remember_days,
            token,
            cache,
            http,
            events,
            clock,
            authenticated: AtomicBool::new(false),
            remember: AtomicBool::new(config.authentication.should_remember),
            redirect: Mutex::new(None),
        }
    }

    /// Wire every collaborator over `storages` and `transport`.
    ///
    /// Initializing the token store picks up a rotated credential, and the
    /// cache loads its snapshot from local storage.
    pub async fn init(
        config: &Config,
        storages: Storages,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = Events::new();
        let cache = Arc::new(Cache::load(config.cache.name.clone(), storages.local.clone(), clock.clone()).await);
        let token = Arc::new(Token::init(config, storages).await);
        let http = Arc::new(Http::new(config, transport, token.clone(), events.clone()));
        Self::new(config, token, cache, http, events, clock)
    }

    pub fn token(&self) -> &Arc<Token> {
        &self.token
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn http(&self) -> &Arc<Http> {
        &self.http
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    fn storages(&self) -> &Storages {
        self.token.storages()
    }

    /// Validate the session with the server.
    ///
    /// Without `force`, the request is only made when a credential is
    /// present or this process already holds a session, e.g. a login whose
    /// response carried no credential. Never fails: any error leaves the
    /// client unauthenticated.
    pub async fn check(&self, force: bool) -> bool {
        let has_token = self.token.get().await.is_some();
        if !force && !has_token && !self.is_authenticated() {
            debug!("No credential, skipping authentication check");
            self.unauthenticate().await;
            return false;
        }

        match self.http.get(&self.config.endpoints.check).await {
            Ok(response) => {
                let user = response.get("data").cloned().unwrap_or(response);
                self.storages().set_logged_in(true).await;
                self.set_user(user.clone()).await;
                self.authenticated.store(true, Ordering::SeqCst);
                self.events.broadcast(AuthEvent::Check, Some(user));
                true
            }
            Err(e) => {
                debug!(error = %e, "Authentication check failed");
                self.unauthenticate().await;
                false
            }
        }
    }

    /// Exchange credentials for a session and return the user record.
    pub async fn login(&self, credentials: Value) -> Result<Value, ApiError> {
        let response = match self.http.post(&self.config.endpoints.login, Some(credentials)).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.authenticated.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        Ok(self.logged_in(&response).await)
    }

    /// Side effects of a successful login response
    async fn logged_in(&self, response: &Value) -> Value {
        let expiry = self.credential_expiry();
        if let Some(access) = self.token.read(response) {
            self.token
                .set_with(&access, TokenOptions { expiry, ..Default::default() })
                .await;
        } else {
            debug!("Login response carried no credential");
        }
        if let Some(refresh) = self.token.read_refresh(response) {
            let options = TokenOptions {
                key: Some(self.token.refresh_key().to_string()),
                expiry,
                ..Default::default()
            };
            self.token.set_with(&refresh, options).await;
        }

        self.storages().set_logged_in(true).await;

        let user = response
            .get("user")
            .or_else(|| response.get("data"))
            .cloned()
            .unwrap_or(Value::Null);
        if !user.is_null() {
            self.set_user(user.clone()).await;
        }

        self.authenticated.store(true, Ordering::SeqCst);
        self.events.broadcast(AuthEvent::LoggingIn, Some(user.clone()));
        info!("Logged in");
        user
    }

    /// End the session. The server is notified best-effort; local state is
    /// always cleared and the result is always true.
    pub async fn logout(&self) -> bool {
        if let Err(e) = self.http.post(&self.config.endpoints.logout, None).await {
            debug!(error = %e, "Server logout failed, clearing local session anyway");
        }
        self.unauthenticate().await;
        self.events.broadcast(AuthEvent::LoggedOut, None);
        info!("Logged out");
        true
    }

    /// Clear local session state without contacting the server
    pub async fn unauthenticate(&self) {
        self.token.destroy().await;
        self.storages().set_logged_in(false).await;
        self.cache.remove(USER_CACHE_KEY).await;
        self.authenticated.store(false, Ordering::SeqCst);
        self.http.invalidate();
    }

    /// Trade the stored refresh credential for a new access credential.
    ///
    /// On failure the current credentials are left untouched.
    pub async fn refresh(&self, payload: Value) -> bool {
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                warn!(payload = %other, "Refresh payload must be an object");
                return false;
            }
        };
        if let Some(refresh) = self.token.get_key(self.token.refresh_key()).await {
            body.entry(REFRESH_FIELD).or_insert(Value::String(refresh));
        }

        let response = match self.http.post(&self.config.endpoints.refresh, Some(Value::Object(body))).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                return false;
            }
        };

        let Some(access) = self.token.read(&response) else {
            warn!("Refresh response carried no credential");
            return false;
        };

        let expiry = self.credential_expiry();
        self.token
            .set_with(&access, TokenOptions { expiry, ..Default::default() })
            .await;
        if let Some(refresh) = self.token.read_refresh(&response) {
            let options = TokenOptions {
                key: Some(self.token.refresh_key().to_string()),
                expiry,
                ..Default::default()
            };
            self.token.set_with(&refresh, options).await;
        }
        self.http.invalidate();
        debug!("Refreshed access credential");
        true
    }

    /// Create an account. A response carrying a credential also logs in.
    pub async fn register(&self, data: Value) -> Result<Value, ApiError> {
        let response = self
            .http
            .post(&self.config.endpoints.register, Some(data))
            .await
            .inspect_err(|e| warn!(error = %e, "Registration failed"))?;

        if self.token.read(&response).is_some() {
            return Ok(self.logged_in(&response).await);
        }
        Ok(response
            .get("user")
            .or_else(|| response.get("data"))
            .cloned()
            .unwrap_or(response))
    }

    pub async fn forgot_password(&self, data: Value) -> Result<Value, ApiError> {
        self.http
            .post(&self.config.endpoints.forgot_password, Some(data))
            .await
            .inspect_err(|e| warn!(error = %e, "Forgot password request failed"))
    }

    pub async fn reset_password(&self, data: Value) -> Result<Value, ApiError> {
        self.http
            .post(&self.config.endpoints.reset_password, Some(data))
            .await
            .inspect_err(|e| warn!(error = %e, "Password reset failed"))
    }

    /// Whether the next login persists the credential beyond this session
    pub fn remember(&self, remember: bool) {
        self.remember.store(remember, Ordering::SeqCst);
    }

    pub fn should_remember(&self) -> bool {
        self.remember.load(Ordering::SeqCst)
    }

    /// Cookie expiry for a new credential. None keeps it a session cookie.
    /// A lifetime past the representable range is capped at the maximum date.
    fn credential_expiry(&self) -> Option<DateTime<Utc>> {
        if !self.should_remember() {
            return None;
        }
        let expiry = Duration::try_days(self.remember_days)
            .and_then(|lifetime| self.clock.now().checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(expiry)
    }

    /// Result of the latest check, login or logout
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub async fn user(&self) -> Option<Value> {
        self.cache.get(USER_CACHE_KEY).await
    }

    pub async fn set_user(&self, user: Value) {
        self.cache
            .set(USER_CACHE_KEY, user, Some(self.config.user_ttl_secs))
            .await;
    }

    pub fn set_redirect(&self, url: impl Into<String>) {
        *self.redirect.lock().unwrap_or_else(|e| e.into_inner()) = Some(url.into());
    }

    /// The stored redirect. Reading it clears it.
    pub fn get_redirect(&self) -> Option<String> {
        self.redirect.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn set_driver(&self, driver: Driver) {
        self.token.set_driver(driver);
        self.http.invalidate();
    }

    pub async fn get_token(&self, key: &str) -> Option<String> {
        self.token.get_key(key).await
    }
}
