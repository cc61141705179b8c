//! sessionkit core - client-side session and identity layer.
//!
//! This crate provides:
//! - `storage`: four interchangeable key/value backends (session, local,
//!   cookie, durable indexed store) behind one `Storage` trait
//! - `token`: the credential store with unload-time rotation
//! - `cache`: a TTL key/value cache mirrored to durable storage
//! - `auth`: the authentication orchestrator (login, logout, check, ...)
//! - `api`: the HTTP layer and transports
//! - `events`: the notification channel used to announce auth changes

pub mod api;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod disposal;
pub mod events;
pub mod storage;
pub mod token;

pub use api::{ApiError, Http, Method, ReqwestTransport, Request, Transport};
pub use auth::Authentication;
pub use cache::Cache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use disposal::Disposable;
pub use events::{AuthEvent, Events, Notification};
pub use storage::{Driver, Storage, Storages};
pub use token::{Token, TokenOptions};
