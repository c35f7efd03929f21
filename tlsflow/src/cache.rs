//! Bounded least-recently-used correlation cache.
//!
//! Used for auxiliary lookups that must not grow with the number of
//! connections observed, such as remembering which address quad a
//! `(process, fd)` pair belonged to.

use std::{hash::Hash, num::NonZeroUsize};

use lru::LruCache;
use thiserror::Error;
use tracing::info;

use crate::metrics::registry::CACHE_EVICTIONS_TOTAL;

/// A diagnostic line is emitted once per this many evictions.
pub const EVICTION_LOG_INTERVAL: u64 = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache capacity must be positive, got {0}")]
    InvalidCapacity(usize),

    #[error("average cache entry size must be positive")]
    InvalidEntrySize,
}

pub struct CorrelationCache<K: Hash + Eq, V> {
    name: &'static str,
    entries: LruCache<K, V>,
    evicted: u64,
}

impl<K: Hash + Eq, V> CorrelationCache<K, V> {
    pub fn new(name: &'static str, capacity: usize) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(CacheError::InvalidCapacity(capacity))?;

        Ok(Self {
            name,
            entries: LruCache::new(capacity),
            evicted: 0,
        })
    }

    /// Size the cache so that `memory_ceiling` bytes hold at most
    /// `memory_ceiling / avg_entry_size` entries.
    pub fn with_memory_ceiling(
        name: &'static str,
        memory_ceiling: usize,
        avg_entry_size: usize,
    ) -> Result<Self, CacheError> {
        if avg_entry_size == 0 {
            return Err(CacheError::InvalidEntrySize);
        }
        Self::new(name, memory_ceiling / avg_entry_size)
    }

    /// Insert or refresh `key`; evicts the least recently used entry when full.
    pub fn insert(&mut self, key: K, value: V) {
        let is_new = !self.entries.contains(&key);
        if self.entries.push(key, value).is_some() && is_new {
            self.on_evict();
        }
    }

    /// Look up `key`, marking it as most recently used.
    pub fn lookup(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Cumulative number of evictions since construction.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Returns whether the throttled diagnostic line fired.
    fn on_evict(&mut self) -> bool {
        self.evicted += 1;
        CACHE_EVICTIONS_TOTAL.with_label_values(&[self.name]).inc();

        if self.evicted % EVICTION_LOG_INTERVAL == 0 {
            info!(
                event.name = "cache.evictions",
                cache.name = self.name,
                cache.evicted = self.evicted,
                "{} cache evicted {} items",
                self.name,
                self.evicted
            );
            return true;
        }
        false
    }
}
