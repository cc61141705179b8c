//! The request capability consumed by the core.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use super::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Fully resolved URL
    pub url: String,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

/// Sends a request and returns the decoded JSON body.
///
/// Non-2xx responses must be returned as `ApiError`, with 401 mapped to
/// `ApiError::Unauthorized` and structured bodies kept intact.
/// Implementations enforce their own timeouts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Value, ApiError>;
}
