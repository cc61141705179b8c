//! Authentication orchestrator.
//!
//! This module provides `Authentication`, which composes the token store,
//! the cache and the HTTP layer into login, logout, check, refresh and
//! register flows, and announces state changes on the `Events` channel.
//!
//! Being authenticated is never trusted from storage: `check` recomputes it
//! against the server. Only the user record is cached between calls.

pub mod authentication;

pub use authentication::{Authentication, USER_CACHE_KEY};
