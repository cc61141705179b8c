//! HTTP layer.
//!
//! This module provides:
//! - `Transport`: the request capability the core consumes
//! - `ReqwestTransport`: the production transport over reqwest
//! - `Http`: URL resolution, default and Authorization headers, and the
//!   `auth:required` notification on 401 responses

pub mod client;
pub mod error;
pub mod http;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::ReqwestTransport;
pub use error::ApiError;
pub use http::Http;
pub use transport::{Method, Request, Transport};
