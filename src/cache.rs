//! Bounded caching for repeated similarity computations
//!
//! Scoring a scan against every known layout, and matching line items against
//! stored descriptions, recompute the same string similarities many times. This
//! module provides an explicit, capacity-bounded LRU cache that components take
//! as an injected dependency instead of relying on global state.
//!
//! ## Usage Examples
//!
//! ```rust
//! use form_layout_learner::cache::{LruCache, SimilarityCache};
//!
//! let cache: SimilarityCache = LruCache::new(128);
//! let score = cache.get_or_insert_with(("acme".to_string(), "acne".to_string()), || 0.75);
//! assert_eq!(score, 0.75);
//! assert_eq!(cache.stats().hits, 0);
//! ```

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of entries
    pub entries: usize,
    /// Number of hits
    pub hits: u64,
    /// Number of misses
    pub misses: u64,
    /// Number of entries evicted to respect the capacity
    pub evictions: u64,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

struct LruState<K, V> {
    /// key -> (value, last-use tick)
    entries: HashMap<K, (V, u64)>,
    /// last-use tick -> key, oldest first
    recency: BTreeMap<u64, K>,
    tick: u64,
    stats: CacheStats,
}

impl<K, V> LruState<K, V>
where
    K: Clone + Eq + Hash,
{
    fn touch(&mut self, key: &K) -> Option<u64> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        let old = std::mem::replace(&mut entry.1, tick);
        self.recency.remove(&old);
        self.recency.insert(tick, key.clone());
        Some(tick)
    }
}

/// Thread-safe least-recently-used cache with a fixed capacity
pub struct LruCache<K, V> {
    capacity: usize,
    state: Mutex<LruState<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Get a value, marking it as most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        if state.touch(key).is_some() {
            state.stats.hits += 1;
            state.entries.get(key).map(|(v, _)| v.clone())
        } else {
            state.stats.misses += 1;
            None
        }
    }

    /// Insert a value, evicting the least recently used entry when full
    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock();
        if state.entries.contains_key(&key) {
            state.touch(&key);
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.0 = value;
            }
            return;
        }

        while state.entries.len() >= self.capacity {
            let oldest = state.recency.keys().next().copied();
            match oldest.and_then(|tick| state.recency.remove(&tick)) {
                Some(evicted) => {
                    state.entries.remove(&evicted);
                    state.stats.evictions += 1;
                }
                None => break,
            }
        }

        state.tick += 1;
        let tick = state.tick;
        state.recency.insert(tick, key.clone());
        state.entries.insert(key, (value, tick));
    }

    /// Return the cached value or compute, store and return it
    pub fn get_or_insert_with<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.entries = state.entries.len();
        let total_requests = stats.hits + stats.misses;
        if total_requests > 0 {
            stats.hit_rate = stats.hits as f64 / total_requests as f64;
        }
        stats
    }

    /// Clear all entries and statistics
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.recency.clear();
        state.stats = CacheStats::default();
    }
}

/// Cache of string-pair similarities keyed by the two canonical strings
pub type SimilarityCache = LruCache<(String, String), f64>;

/// Shared handle so a cache can be injected into several components
pub type SharedSimilarityCache = Arc<SimilarityCache>;

/// Create a new shared similarity cache
pub fn create_shared_similarity_cache(capacity: usize) -> SharedSimilarityCache {
    Arc::new(LruCache::new(capacity))
}
