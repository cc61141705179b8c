//! Request helper: resolves URLs, attaches headers and reports 401s.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ApiError, Method, Request, Transport};
use crate::config::Config;
use crate::events::{AuthEvent, Events};
use crate::token::Token;

const AUTHORIZATION: &str = "Authorization";

/// Memoized Authorization header, valid only while the session generation
/// it was built at is current.
struct HeaderMemo {
    generation: u64,
    value: Option<String>,
}

pub struct Http {
    transport: Arc<dyn Transport>,
    token: Arc<Token>,
    events: Events,
    base_url: Option<String>,
    headers: BTreeMap<String, String>,
    scheme: Option<String>,
    method_token: bool,
    debug: bool,
    memo: Mutex<Option<HeaderMemo>>,
}

impl Http {
    pub fn new(config: &Config, transport: Arc<dyn Transport>, token: Arc<Token>, events: Events) -> Self {
        Self {
            transport,
            token,
            events,
            base_url: config.http.base_url.clone(),
            headers: config.http.headers.clone(),
            scheme: config.token.scheme.clone(),
            method_token: config.authentication.method_token,
            debug: config.debug,
            memo: Mutex::new(None),
        }
    }

    /// Resolve `path` against the base URL. Absolute URLs and paths rooted
    /// at `/` are used as given.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') || path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        match self.base_url.as_deref() {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), path),
            None => path.to_string(),
        }
    }

    /// Forget the memoized Authorization header
    pub fn invalidate(&self) {
        *self.memo.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// `<scheme> <credential>`, or None without a credential.
    ///
    /// A value built while loggingIn, loggedOut or check was published is
    /// thrown away and rebuilt.
    pub async fn authorization(&self) -> Option<String> {
        if !self.method_token {
            return None;
        }
        loop {
            let generation = self.events.session_generation();
            let cached = {
                let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
                memo.as_ref()
                    .filter(|memo| memo.generation == generation)
                    .map(|memo| memo.value.clone())
            };
            if let Some(value) = cached {
                return value;
            }

            let value = self.token.get().await.map(|token| match self.scheme.as_deref() {
                Some(scheme) if !scheme.is_empty() => format!("{} {}", scheme, token),
                _ => token,
            });
            if self.memoize(generation, value.clone()) {
                return value;
            }
            debug!("Session changed while building the Authorization header");
        }
    }

    /// Store a header built at `generation`. Refused once the session has
    /// moved on.
    fn memoize(&self, generation: u64, value: Option<String>) -> bool {
        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        if self.events.session_generation() != generation {
            return false;
        }
        *memo = Some(HeaderMemo { generation, value });
        true
    }

    /// Configured headers plus Authorization, with `extra` taking precedence
    pub async fn headers(&self, extra: BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        if let Some(authorization) = self.authorization().await {
            headers.insert(AUTHORIZATION.to_string(), authorization);
        }
        headers.extend(extra);
        headers
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: BTreeMap<String, String>,
    ) -> Result<Value, ApiError> {
        let request = Request {
            method,
            url: self.url(path),
            body,
            headers: self.headers(headers).await,
        };
        let url = request.url.clone();

        match self.transport.send(request).await {
            Ok(response) => Ok(response),
            Err(error) => {
                if self.debug {
                    warn!(method = %method, url = %url, error = %error, "Request failed");
                } else {
                    debug!(method = %method, url = %url, error = %error, "Request failed");
                }
                if let ApiError::Unauthorized(body) = &error {
                    self.events.broadcast(
                        AuthEvent::Required,
                        Some(json!({ "status": 401, "error": body })),
                    );
                }
                Err(error)
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.request(Method::Get, path, None, BTreeMap::new()).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        self.request(Method::Post, path, body, BTreeMap::new()).await
    }

    pub async fn put(&self, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        self.request(Method::Put, path, body, BTreeMap::new()).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.request(Method::Delete, path, None, BTreeMap::new()).await
    }
}
