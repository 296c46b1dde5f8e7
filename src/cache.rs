//! Shared TTL cache used for inter-node result handoff and request
//! resumability.
//!
//! The engine never reaches for a global cache handle: a [`ResultCache`] is
//! constructed once at process start and passed into every execution
//! context. Keys are request-id scoped, so concurrent requests need no
//! cross-request locking.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::errors::Result;
use crate::core::value::FieldValue;
use crate::graph::config::CollectionAddress;
use crate::policy::ActionType;

/// Key under which one node's rows are cached for one request.
pub fn result_key(request_id: &str, action: ActionType, address: &CollectionAddress) -> String {
    format!("{}__{}__{}", request_id, action, address)
}

/// Prefix covering every cached value belonging to a request.
pub fn request_prefix(request_id: &str) -> String {
    format!("{}__", request_id)
}

/// The cache contract the executor runs against.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Liveness check. A request may not begin when this fails.
    async fn ping(&self) -> Result<()>;

    async fn set(&self, key: &str, value: FieldValue, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<FieldValue>>;

    /// All live entries whose key starts with `prefix`.
    async fn get_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, FieldValue>>;

    /// Removes matching entries, returning how many were dropped.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64>;
}

struct CacheEntry {
    value: FieldValue,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`ResultCache`] backed by a concurrent map. Entries expire
/// lazily on read; an optional background sweeper reclaims memory for
/// long-lived processes.
pub struct InMemoryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            sweeper: None,
        }
    }

    /// Like [`InMemoryCache::new`], plus a background task that drops
    /// expired entries every `interval`. Must be called within a tokio
    /// runtime.
    pub fn with_sweeper(interval: Duration) -> Self {
        let entries: Arc<DashMap<String, CacheEntry>> = Arc::new(DashMap::new());
        let swept = Arc::clone(&entries);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let before = swept.len();
                swept.retain(|_, entry| entry.is_live(now));
                let dropped = before - swept.len();
                if dropped > 0 {
                    debug!(dropped, "cache sweep reclaimed expired entries");
                }
            }
        });
        Self {
            entries,
            sweeper: Some(sweeper),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryCache {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl ResultCache for InMemoryCache {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn set(&self, key: &str, value: FieldValue, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<FieldValue>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                drop(self.entries.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, FieldValue>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let before = self.entries.len() as u64;
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - self.entries.len() as u64)
    }
}
