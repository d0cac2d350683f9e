//! Response cache gateway.
//!
//! The coordinator consults a [`ResponseCache`] in `get_with_cache`. Entries are keyed by full
//! URL within a named partition, carry an optional expiration, and hold the decoded body with
//! its status. Error entries are only returned to callers that ask for them.

use crate::transport::is_success;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Partition used when the caller names none.
pub const DEFAULT_PARTITION: &str = "httpCache";

/// A stored response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub data: Value,
}

impl CachedResponse {
    pub fn is_success(&self) -> bool {
        is_success(self.status)
    }
}

/// Per-call cache behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Partition name; [`DEFAULT_PARTITION`] when `None`.
    pub partition: Option<String>,
    /// Lifetime of a stored entry; `None` keeps it until cleared.
    pub expiration: Option<Duration>,
    /// Also store and return non-success responses.
    pub cache_errors: bool,
}

impl CacheOptions {
    pub fn partition(&self) -> &str {
        self.partition.as_deref().unwrap_or(DEFAULT_PARTITION)
    }

    pub fn in_partition(mut self, name: impl Into<String>) -> Self {
        self.partition = Some(name.into());
        self
    }

    pub fn expiring_after(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_errors(mut self) -> Self {
        self.cache_errors = true;
        self
    }
}

/// Storage behind `get_with_cache`. Implementations must tolerate interleaved reads and writes.
#[async_trait]
pub trait ResponseCache: Send + Sync + std::fmt::Debug {
    /// Fresh entry for `url`; error entries only when `options.cache_errors` is set.
    async fn get(&self, url: &str, options: &CacheOptions) -> Option<CachedResponse>;
    async fn put(&self, url: &str, response: CachedResponse, options: &CacheOptions);
    /// Whether an unexpired success entry exists.
    async fn has_fresh_entry(&self, url: &str, partition: Option<&str>) -> bool;
    async fn clear_partition(&self, partition: &str);
    async fn clear_all(&self);
}

#[derive(Debug)]
struct Entry {
    response: CachedResponse,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process cache keyed by partition and URL. Expiry follows the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryCache {
    partitions: Mutex<HashMap<String, HashMap<String, Entry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries and return how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut partitions = self.lock();
        let mut removed = 0;
        for entries in partitions.values_mut() {
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            removed += before - entries.len();
        }
        partitions.retain(|_, entries| !entries.is_empty());
        removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Entry>>> {
        self.partitions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, url: &str, partition: &str) -> Option<CachedResponse> {
        let now = Instant::now();
        let mut partitions = self.lock();
        let entries = partitions.get_mut(partition)?;
        match entries.get(url) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(url);
                None
            }
            Some(entry) => Some(entry.response.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, url: &str, options: &CacheOptions) -> Option<CachedResponse> {
        self.lookup(url, options.partition())
            .filter(|response| response.is_success() || options.cache_errors)
    }

    async fn put(&self, url: &str, response: CachedResponse, options: &CacheOptions) {
        if !response.is_success() && !options.cache_errors {
            return;
        }
        let expires_at = options.expiration.map(|ttl| Instant::now() + ttl);
        self.lock()
            .entry(options.partition().to_string())
            .or_default()
            .insert(url.to_string(), Entry { response, expires_at });
    }

    async fn has_fresh_entry(&self, url: &str, partition: Option<&str>) -> bool {
        self.lookup(url, partition.unwrap_or(DEFAULT_PARTITION))
            .is_some_and(|response| response.is_success())
    }

    async fn clear_partition(&self, partition: &str) {
        self.lock().remove(partition);
    }

    async fn clear_all(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok() -> CachedResponse {
        CachedResponse { status: 200, data: json!({"id": "1"}) }
    }

    fn not_found() -> CachedResponse {
        CachedResponse { status: 404, data: json!("missing") }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        let options = CacheOptions::default().expiring_after(Duration::from_secs(10));
        cache.put("u", ok(), &options).await;
        assert_eq!(cache.get("u", &options).await, Some(ok()));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("u", &options).await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn errors_need_opt_in() {
        let cache = MemoryCache::new();
        cache.put("u", not_found(), &CacheOptions::default()).await;
        assert!(cache.is_empty());

        let with_errors = CacheOptions::default().with_errors();
        cache.put("u", not_found(), &with_errors).await;
        assert_eq!(cache.get("u", &CacheOptions::default()).await, None);
        assert_eq!(cache.get("u", &with_errors).await, Some(not_found()));
        assert!(!cache.has_fresh_entry("u", None).await);
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let cache = MemoryCache::new();
        let a = CacheOptions::default().in_partition("a");
        let b = CacheOptions::default().in_partition("b");
        cache.put("u", ok(), &a).await;
        cache.put("u", ok(), &b).await;
        cache.clear_partition("a").await;
        assert!(!cache.has_fresh_entry("u", Some("a")).await);
        assert!(cache.has_fresh_entry("u", Some("b")).await);
        cache.clear_all().await;
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evict_expired_counts_removed_entries() {
        let cache = MemoryCache::new();
        let short = CacheOptions::default().expiring_after(Duration::from_secs(1));
        cache.put("a", ok(), &short).await;
        cache.put("b", ok(), &CacheOptions::default()).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
