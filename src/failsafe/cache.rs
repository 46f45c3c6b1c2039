//! Last-known-good results for cached-result fallback
//!
//! One entry per tool id, last writer wins. Staleness is judged by the
//! fallback resolver against the tool's `max_staleness`, not here, so an
//! entry is kept until it is overwritten or cleared.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// A stored tool result and when it was produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResult {
    /// The result value
    pub value: Value,
    /// When the result was stored
    pub stored_at: DateTime<Utc>,
}

/// Key-value store of the latest successful result per tool
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Latest result for `tool_id`, if any
    async fn get(&self, tool_id: &str) -> Result<Option<CachedResult>>;

    /// Replace the result for `tool_id`
    async fn set(&self, tool_id: &str, value: Value, stored_at: DateTime<Utc>) -> Result<()>;

    /// Hit/miss counters, for stores that keep them
    fn stats(&self) -> Option<CacheStatsSnapshot> {
        None
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheStats {
    /// Lookups that found an entry
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries written
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Hit rate (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Statistics snapshot, served on `/dashboard`
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Total hits
    pub hits: u64,
    /// Total misses
    pub misses: u64,
    /// Total writes
    pub writes: u64,
    /// Entries held
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

/// In-process cache store
///
/// ```
/// # tokio_test::block_on(async {
/// use toolguard::failsafe::{CacheStore, MemoryCacheStore};
///
/// let cache = MemoryCacheStore::new();
/// cache.set("roster", serde_json::json!({ "ok": true }), chrono::Utc::now()).await?;
/// assert!(cache.get("roster").await?.is_some());
/// assert_eq!(cache.snapshot().hits, 1);
/// # Ok::<(), toolguard::Error>(())
/// # }).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, CachedResult>,
    stats: CacheStats,
}

impl MemoryCacheStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current statistics
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            writes: self.stats.writes(),
            size: self.entries.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }

    /// Drop one tool's entry
    pub fn remove(&self, tool_id: &str) {
        self.entries.remove(tool_id);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, tool_id: &str) -> Result<Option<CachedResult>> {
        let entry = self.entries.get(tool_id).map(|e| e.value().clone());
        if entry.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entry)
    }

    async fn set(&self, tool_id: &str, value: Value, stored_at: DateTime<Utc>) -> Result<()> {
        self.entries
            .insert(tool_id.to_string(), CachedResult { value, stored_at });
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> Option<CacheStatsSnapshot> {
        Some(self.snapshot())
    }
}
