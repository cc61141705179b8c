//! TTL key/value cache.
//!
//! This module provides the `Cache` for values derived from the session
//! (the authenticated user record, for one). Entries are held in memory and
//! the whole mapping is mirrored to a durable backend under the cache name.
//!
//! Expiry is lazy: an expired entry reads as absent immediately but is only
//! purged by `Cache::refresh`, which the host schedules.

pub mod manager;

pub use manager::{Cache, CacheEntry};
