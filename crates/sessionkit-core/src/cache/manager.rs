use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: DateTime<Utc>,
    /// Seconds to live; 0 never expires
    #[serde(default)]
    pub ttl: u64,
}

impl CacheEntry {
    pub fn new(value: Value, created_at: DateTime<Utc>, ttl: u64) -> Self {
        Self {
            value,
            created_at,
            ttl,
        }
    }

    /// None when the entry never expires, including a ttl too large to
    /// represent as a date
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl == 0 {
            return None;
        }
        let seconds = i64::try_from(self.ttl).ok()?;
        self.created_at.checked_add_signed(Duration::try_seconds(seconds)?)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires| expires <= now)
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_minutes()
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_minutes(now);
        if minutes < 1 {
            // Includes clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

type Entries = HashMap<String, CacheEntry>;

/// In-memory TTL cache mirrored to a durable backend.
///
/// The in-memory mapping is authoritative. Every mutation writes a snapshot
/// of the whole mapping; concurrent writers race and the last snapshot wins.
pub struct Cache {
    name: String,
    entries: RwLock<Entries>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl Cache {
    /// Create a cache and load its snapshot. A missing or unreadable
    /// snapshot starts an empty cache.
    pub async fn load(name: impl Into<String>, storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        let entries = match storage.get(&name).await {
            Some(snapshot) => serde_json::from_value::<Entries>(snapshot).unwrap_or_else(|e| {
                warn!(cache = %name, error = %e, "Discarding unreadable cache snapshot");
                Entries::new()
            }),
            None => Entries::new(),
        };
        debug!(cache = %name, entries = entries.len(), "Loaded cache");

        Self {
            name,
            entries: RwLock::new(entries),
            storage,
            clock,
        }
    }

    /// Storage key of the durable snapshot
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or overwrite `key`. A ttl of `None` or 0 never expires.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<u64>) {
        let entry = CacheEntry::new(value, self.clock.now(), ttl.unwrap_or(0));
        self.entries.write().await.insert(key.to_string(), entry);
        self.save_cache().await;
    }

    /// Serialize and insert any value
    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u64>) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, ttl).await;
        Ok(())
    }

    /// The live value of `key`, or None if absent or expired.
    /// Expired entries are left in place for `refresh`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entry(key).await.map(|entry| entry.value)
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        serde_json::from_value(value)
            .map_err(|e| debug!(key, error = %e, "Cached value has an unexpected shape"))
            .ok()
    }

    /// The live entry, including its timestamp
    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// How long ago the live entry was written, e.g. "5m ago"
    pub async fn age(&self, key: &str) -> Option<String> {
        let entry = self.entry(key).await?;
        Some(entry.age_display(self.clock.now()))
    }

    pub async fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Get then remove. The entry is removed even when already expired.
    pub async fn pull(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let removed = self.entries.write().await.remove(key);
        if removed.is_some() {
            self.save_cache().await;
        }
        removed
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value)
    }

    pub async fn remove(&self, key: &str) {
        let removed = self.entries.write().await.remove(key);
        if removed.is_some() {
            self.save_cache().await;
        }
    }

    /// Purge every expired entry from memory and from the snapshot
    pub async fn refresh(&self) {
        let now = self.clock.now();
        let purged = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            before - entries.len()
        };
        if purged > 0 {
            debug!(cache = %self.name, purged, "Purged expired cache entries");
            self.save_cache().await;
        }
    }

    /// Write the whole mapping to the durable backend
    pub async fn save_cache(&self) {
        let snapshot = self.entries.read().await.clone();
        match serde_json::to_value(&snapshot) {
            Ok(value) => self.storage.set(&self.name, value).await,
            Err(e) => warn!(cache = %self.name, error = %e, "Failed to serialize cache snapshot"),
        }
    }

    /// Empty the cache and delete the durable snapshot itself
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.storage.remove(&self.name).await;
    }

    /// Keys of live entries
    pub async fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.keys().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::LocalStorage;
    use serde_json::json;

    async fn cache_with(storage: Arc<LocalStorage>, clock: Arc<ManualClock>) -> Cache {
        Cache::load("cache", storage, clock).await
    }

    #[tokio::test]
    async fn test_can_cache_values_of_any_shape() {
        let cache = cache_with(Arc::new(LocalStorage::memory()), Arc::new(ManualClock::default())).await;

        cache.set("foo", json!("bar"), None).await;
        cache.set("true", json!(true), None).await;
        cache.set("names", json!(["foo", "bar", "baz"]), None).await;
        cache.set("object", json!({"a": {"b": {"c": true}}}), None).await;

        assert_eq!(cache.get("foo").await, Some(json!("bar")));
        assert_eq!(cache.get("true").await, Some(json!(true)));
        assert_eq!(cache.get("names").await, Some(json!(["foo", "bar", "baz"])));
        assert_eq!(cache.get("object").await, Some(json!({"a": {"b": {"c": true}}})));
        assert!(cache.has("foo").await);
    }

    #[tokio::test]
    async fn test_typed_access() {
        let cache = cache_with(Arc::new(LocalStorage::memory()), Arc::new(ManualClock::default())).await;
        cache.put("ids", &vec![1, 2, 3], None).await.expect("serialize");

        assert_eq!(cache.get_as::<Vec<i32>>("ids").await, Some(vec![1, 2, 3]));
        assert_eq!(cache.get_as::<String>("ids").await, None);
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        let storage = Arc::new(LocalStorage::memory());
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(storage.clone(), clock.clone()).await;
        cache.set("foo", json!("bar"), Some(2)).await;

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get("foo").await, Some(json!("bar")));

        // createdAt + ttl <= now is expired
        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get("foo").await, None);
        assert!(!cache.has("foo").await);

        // Still physically present until refreshed
        let snapshot = storage.get("cache").await.expect("snapshot");
        assert!(snapshot.get("foo").is_some());

        cache.refresh().await;
        let snapshot = storage.get("cache").await.expect("snapshot");
        assert!(snapshot.get("foo").is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(Arc::new(LocalStorage::memory()), clock.clone()).await;
        cache.set("forever", json!(1), Some(0)).await;

        clock.advance(Duration::days(3650));
        cache.refresh().await;
        assert_eq!(cache.get("forever").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_pull_removes_the_entry() {
        let cache = cache_with(Arc::new(LocalStorage::memory()), Arc::new(ManualClock::default())).await;
        cache.set("foo", json!("bar"), None).await;

        assert_eq!(cache.pull("foo").await, Some(json!("bar")));
        assert!(!cache.has("foo").await);
        assert_eq!(cache.pull("foo").await, None);
    }

    #[tokio::test]
    async fn test_pull_purges_expired_entry() {
        let storage = Arc::new(LocalStorage::memory());
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(storage.clone(), clock.clone()).await;
        cache.set("stale", json!(1), Some(1)).await;
        clock.advance(Duration::seconds(5));

        assert_eq!(cache.pull("stale").await, None);
        let snapshot = storage.get("cache").await.expect("snapshot");
        assert!(snapshot.get("stale").is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let cache = cache_with(Arc::new(LocalStorage::memory()), Arc::new(ManualClock::default())).await;
        cache.set("foo", json!("bar"), None).await;
        cache.remove("foo").await;
        assert_eq!(cache.get("foo").await, None);
    }

    #[tokio::test]
    async fn test_clear_deletes_the_snapshot() {
        let storage = Arc::new(LocalStorage::memory());
        let cache = cache_with(storage.clone(), Arc::new(ManualClock::default())).await;
        cache.set("foo", json!("bar"), None).await;
        assert!(storage.get(cache.name()).await.is_some());

        cache.clear().await;
        assert_eq!(storage.get(cache.name()).await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_reload_from_durable_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local.json");
        let clock = Arc::new(ManualClock::default());

        let cache = cache_with(Arc::new(LocalStorage::open(path.clone())), clock.clone()).await;
        cache.set("user", json!({"id": 1}), Some(60)).await;
        cache.set("short", json!(2), Some(1)).await;
        drop(cache);

        clock.advance(Duration::seconds(30));
        let reloaded = cache_with(Arc::new(LocalStorage::open(path)), clock).await;
        assert_eq!(reloaded.get("user").await, Some(json!({"id": 1})));
        assert_eq!(reloaded.get("short").await, None);
        assert_eq!(reloaded.keys().await, vec!["user".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_starts_empty() {
        let storage = Arc::new(LocalStorage::memory());
        storage.set("cache", json!("garbage")).await;

        let cache = cache_with(storage, Arc::new(ManualClock::default())).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_huge_ttl_never_expires() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(Arc::new(LocalStorage::memory()), clock.clone()).await;
        cache.set("big", json!(1), Some(20_000_000_000_000)).await;
        cache.set("max", json!(2), Some(u64::MAX)).await;

        clock.advance(Duration::days(3650));
        cache.refresh().await;
        assert_eq!(cache.get("big").await, Some(json!(1)));
        assert_eq!(cache.get("max").await, Some(json!(2)));
        assert!(cache.has("max").await);
    }

    #[test]
    fn test_entry_age_display() {
        let now = Utc::now();
        let entry = |minutes: i64| CacheEntry::new(json!(null), now - Duration::minutes(minutes), 0);

        assert_eq!(entry(0).age_display(now), "just now");
        assert_eq!(entry(-5).age_display(now), "just now");
        assert_eq!(entry(5).age_display(now), "5m ago");
        assert_eq!(entry(90).age_display(now), "2h ago");
        assert_eq!(entry(60 * 24 * 2).age_display(now), "2d ago");
    }

    #[tokio::test]
    async fn test_age_of_live_entry() {
        let clock = Arc::new(ManualClock::default());
        let cache = cache_with(Arc::new(LocalStorage::memory()), clock.clone()).await;
        cache.set("user", json!({"id": 1}), Some(3600)).await;
        assert_eq!(cache.age("user").await.as_deref(), Some("just now"));

        clock.advance(Duration::minutes(5));
        assert_eq!(cache.age("user").await.as_deref(), Some("5m ago"));

        clock.advance(Duration::hours(1));
        assert_eq!(cache.age("user").await, None);
        assert_eq!(cache.age("missing").await, None);
    }
}
