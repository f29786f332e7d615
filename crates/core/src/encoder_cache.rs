//! LRU cache of image id → embedding vector.
//!
//! Fronts the image encoder: repeated images across requests (multi-turn
//! chats re-sending the same picture) skip the encoder entirely, and
//! concurrent requests for the same image deduplicate into a single
//! encode via the wait set.
//!
//! A key is in one of three states: *absent*, *in-flight* (member of the
//! wait set while the encoder works on it), or *stored*. `prepare` claims
//! the in-flight state; `store` publishes the result; a failed encode must
//! go through [`ImageEmbeddingCache::cancel`] so waiters do not stall.
//!
//! Hit/miss counters live behind a separate lock so stat updates never
//! block cache lookups; snapshots may be slightly stale.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::info;

use crate::runtime::ImageData;

/// Evict down to this share of each cap when maintenance triggers.
const OCCUPANCY_TARGET: f64 = 0.8;

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheState {
    /// Keys currently being encoded.
    wait_set: HashSet<String>,
    stored: HashMap<String, Arc<Vec<f32>>>,
    /// LRU order: oldest key at the front.
    order: VecDeque<String>,
    bytes: usize,
}

struct StatsState {
    hits: u64,
    misses: u64,
    last_maintenance: Instant,
}

pub struct ImageEmbeddingCache {
    state: Mutex<CacheState>,
    stats: Mutex<StatsState>,
    max_entries: usize,
    max_bytes: usize,
    maintenance_interval: Duration,
}

impl ImageEmbeddingCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        info!(max_entries, max_bytes, "image embedding cache initialized");
        Self {
            state: Mutex::new(CacheState {
                wait_set: HashSet::new(),
                stored: HashMap::new(),
                order: VecDeque::new(),
                bytes: 0,
            }),
            stats: Mutex::new(StatsState {
                hits: 0,
                misses: 0,
                last_maintenance: Instant::now(),
            }),
            max_entries,
            max_bytes,
            maintenance_interval: Duration::from_secs(5),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Claim the right to encode `image`. Returns the key when the caller
    /// should encode, `None` when the image is already in-flight or stored.
    pub fn prepare(&self, image: &ImageData) -> Option<String> {
        let key = image.image_id.clone();
        let mut state = self.state.lock().unwrap();
        if state.wait_set.contains(&key) || state.stored.contains_key(&key) {
            return None;
        }
        state.wait_set.insert(key.clone());
        Some(key)
    }

    /// Publish an encode result, moving the key from in-flight to stored
    /// and to the back of the LRU order.
    pub fn store(&self, image: &ImageData, embedding: Vec<f32>) -> bool {
        self.maintain();

        let key = image.image_id.clone();
        let bytes = embedding.len() * std::mem::size_of::<f32>();
        let mut state = self.state.lock().unwrap();
        state.wait_set.remove(&key);
        if state.stored.insert(key.clone(), Arc::new(embedding)).is_none() {
            state.bytes += bytes;
        }
        state.order.retain(|k| k != &key);
        state.order.push_back(key);
        true
    }

    /// Drop an in-flight claim after a failed encode. Required on every
    /// failure path, otherwise waiters block forever.
    pub fn cancel(&self, image: &ImageData) {
        let mut state = self.state.lock().unwrap();
        state.wait_set.remove(&image.image_id);
    }

    /// Stored embedding for `image`, promoting it to most-recently-used.
    pub fn lookup(&self, image: &ImageData) -> Option<Arc<Vec<f32>>> {
        let mut state = self.state.lock().unwrap();
        let hit = state.stored.get(&image.image_id).cloned();
        if hit.is_some() {
            let key = image.image_id.clone();
            state.order.retain(|k| k != &key);
            state.order.push_back(key);
        }
        drop(state);

        let mut stats = self.stats.lock().unwrap();
        if hit.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        hit
    }

    pub fn waiting(&self, image: &ImageData) -> bool {
        self.state.lock().unwrap().wait_set.contains(&image.image_id)
    }

    pub fn storing(&self, image: &ImageData) -> bool {
        self.state.lock().unwrap().stored.contains_key(&image.image_id)
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let state = self.state.lock().unwrap();
            (state.stored.len(), state.bytes)
        };
        let stats = self.stats.lock().unwrap();
        CacheStats {
            entries,
            bytes,
            hits: stats.hits,
            misses: stats.misses,
        }
    }

    /// Evict oldest entries down to 80% of both caps. Runs at most once per
    /// maintenance interval, and only when a cap is reached.
    fn maintain(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        {
            let mut stats = self.stats.lock().unwrap();
            if now.duration_since(stats.last_maintenance) < self.maintenance_interval {
                return;
            }
            if state.stored.len() < self.max_entries && state.bytes < self.max_bytes {
                return;
            }
            stats.last_maintenance = now;
        }

        let target_entries = (self.max_entries as f64 * OCCUPANCY_TARGET) as usize;
        let target_bytes = (self.max_bytes as f64 * OCCUPANCY_TARGET) as usize;
        while state.stored.len() > target_entries || state.bytes > target_bytes {
            let Some(key) = state.order.pop_front() else {
                break;
            };
            if let Some(embedding) = state.stored.remove(&key) {
                state.bytes -= embedding.len() * std::mem::size_of::<f32>();
                info!(key = %key, remaining = state.stored.len(), "evicted image embedding");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img(id: &str) -> ImageData {
        ImageData {
            image_id: id.to_string(),
            n_tokens: 4,
            bitmap: Arc::new(Vec::new()),
        }
    }

    fn small_cache() -> ImageEmbeddingCache {
        // Zero interval so every store may run maintenance immediately.
        ImageEmbeddingCache::new(4, 1 << 20).with_maintenance_interval(Duration::ZERO)
    }

    #[test]
    fn prepare_claims_key_once() {
        let cache = small_cache();
        assert_eq!(cache.prepare(&img("a")).as_deref(), Some("a"));
        assert_eq!(cache.prepare(&img("a")), None); // in-flight
        assert!(cache.waiting(&img("a")));
    }

    #[test]
    fn store_moves_key_to_stored() {
        let cache = small_cache();
        cache.prepare(&img("a"));
        cache.store(&img("a"), vec![0.0; 8]);
        assert!(!cache.waiting(&img("a")));
        assert!(cache.storing(&img("a")));
        assert_eq!(cache.prepare(&img("a")), None); // already stored
    }

    #[test]
    fn cancel_clears_in_flight_claim() {
        let cache = small_cache();
        cache.prepare(&img("a"));
        cache.cancel(&img("a"));
        assert!(!cache.waiting(&img("a")));
        assert!(!cache.storing(&img("a")));
        // Claimable again after the failure.
        assert!(cache.prepare(&img("a")).is_some());
    }

    #[test]
    fn lookup_counts_hits_and_misses() {
        let cache = small_cache();
        cache.prepare(&img("a"));
        cache.store(&img("a"), vec![1.0; 8]);

        assert!(cache.lookup(&img("a")).is_some());
        assert!(cache.lookup(&img("b")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 8 * 4);
    }

    #[test]
    fn eviction_drops_oldest_first() {
        let cache = small_cache();
        for id in ["a", "b", "c", "d"] {
            cache.prepare(&img(id));
            cache.store(&img(id), vec![0.0; 8]);
        }
        // "a" is oldest; a lookup promotes it past "b".
        cache.lookup(&img("a"));

        // Fifth store finds entries == max_entries and evicts to 80% → 3.
        cache.prepare(&img("e"));
        cache.store(&img("e"), vec![0.0; 8]);

        assert!(!cache.storing(&img("b")));
        assert!(cache.storing(&img("a")));
        assert!(cache.storing(&img("e")));
    }

    #[test]
    fn byte_cap_triggers_eviction() {
        let cache =
            ImageEmbeddingCache::new(100, 64).with_maintenance_interval(Duration::ZERO);
        cache.prepare(&img("a"));
        cache.store(&img("a"), vec![0.0; 16]); // 64 bytes, at cap
        cache.prepare(&img("b"));
        cache.store(&img("b"), vec![0.0; 4]);

        // Maintenance ran at the head of the second store: 64 >= cap, so
        // "a" was evicted down to the 51-byte target before "b" landed.
        assert!(!cache.storing(&img("a")));
        assert!(cache.storing(&img("b")));
        assert_eq!(cache.stats().bytes, 16);
    }

    #[test]
    fn maintenance_respects_interval() {
        let cache =
            ImageEmbeddingCache::new(2, 1 << 20).with_maintenance_interval(Duration::from_secs(3600));
        for id in ["a", "b", "c"] {
            cache.prepare(&img(id));
            cache.store(&img(id), vec![0.0; 8]);
        }
        // Interval has not elapsed: nothing evicted even though over cap.
        assert_eq!(cache.stats().entries, 3);
    }
}
