//! Bounded caches owned by the worker host.
//!
//! The host is single-threaded, so unlike shared caches these take `&mut self`
//! and keep plain counters. Entries are `Arc`s: a chunk job holding a decoded
//! workbook is unaffected when the cache evicts or clears it.

use crate::adapter::DecodedWorkbook;
use crate::model::{SheetSummary, WorkbookKey};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_WORKBOOK_CAPACITY: usize = 3;
pub const DEFAULT_STRUCTURE_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Sum of the size hints of the live entries
    pub approx_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A cached payload and the rough memory it stands for
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub payload: V,
    pub size_hint: usize,
}

/// LRU cache with a hard entry limit
pub struct BoundedCache<K: Hash + Eq, V> {
    name: &'static str,
    entries: LruCache<K, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    approx_bytes: usize,
}

impl<K: Hash + Eq + Clone + std::fmt::Debug, V: Clone> BoundedCache<K, V> {
    /// A zero capacity is raised to one
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
            evictions: 0,
            approx_bytes: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                debug!(cache = self.name, ?key, "cache hit");
                Some(entry.payload.clone())
            }
            None => {
                self.misses += 1;
                debug!(cache = self.name, ?key, "cache miss");
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Insert, evicting the least recently used entry when full
    pub fn insert(&mut self, key: K, payload: V, size_hint: usize) {
        self.approx_bytes += size_hint;
        let entry = CacheEntry { payload, size_hint };
        if let Some((evicted, old)) = self.entries.push(key.clone(), entry) {
            self.approx_bytes = self.approx_bytes.saturating_sub(old.size_hint);
            if evicted != key {
                self.evictions += 1;
                debug!(cache = self.name, key = ?evicted, bytes = old.size_hint, "cache eviction");
            }
        }
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

    /// Drop every entry; counters survive
    pub fn clear(&mut self) {
        self.entries.clear();
        self.approx_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            capacity: self.capacity(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            approx_bytes: self.approx_bytes,
        }
    }
}

/// Decoded workbooks keyed by content
pub type WorkbookCache = BoundedCache<WorkbookKey, Arc<DecodedWorkbook>>;

/// Structure summaries keyed by content
pub type StructureCache = BoundedCache<WorkbookKey, Arc<Vec<SheetSummary>>>;

pub fn workbook_cache(capacity: usize) -> WorkbookCache {
    BoundedCache::new("workbook", capacity)
}

pub fn structure_cache(capacity: usize) -> StructureCache {
    BoundedCache::new("structure", capacity)
}
