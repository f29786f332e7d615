//! Chunk-level KV cache over a pool of reserved sequence slots.
//!
//! Non-final chunks of a request leave their computed KV behind: after a
//! chunk decodes, its freshly produced positions are copied into one of
//! the reserved cache slots `[active_max, seq_max)` and published under
//! the chunk's prefix-cumulative hash. A later request whose chunk list
//! matches the prefix re-homes the cached KV into its own slot and skips
//! the decode.
//!
//! Each cache slot holds a *contiguous* KV prefix described by an ordered
//! list of entries; entries shared by several slots (common prefixes that
//! diverge later) are reference-counted, and the global hash map drops a
//! key when its entry's refcount reaches zero.
//!
//! # Build protocol
//!
//! At most one build is outstanding per hash. A request that wants chunk
//! `i` cached first calls [`ChunkInferCache::block_waiting_and_prepare`]:
//! if another request is already building the same hash it waits for that
//! build to settle, then either finds the hash stored (cache hit path) or
//! claims the build itself. Builders release the claim through
//! [`store`](ChunkInferCache::store) on success or
//! [`unprepared`](ChunkInferCache::unprepared) on failure; both notify all
//! waiters.
//!
//! The cache lock is never held across a KV operation: KV clears and
//! copies are enqueued on the memory worker, which also executes every
//! decode, so a queued copy always lands before any decode that depends
//! on it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::memory::MemoryScheduler;
use crate::runtime::{SeqId, Token};

/// Evict down to this share of the slot pool when it fills up.
const OCCUPANCY_TARGET: f64 = 0.8;

/// One cached chunk: the KV positions `[pos_begin, pos_end)` inside its
/// owning slot(s), and the token the chunk's decode sampled. Immutable
/// after insertion except for the refcount.
#[derive(Debug)]
pub struct CacheEntry {
    pub prompt_hash: u64,
    /// Start offset inside the owning slot's KV.
    pub pos_begin: i32,
    /// One past the last position; equals `n_past` after the chunk.
    pub pos_end: i32,
    pub last_token: Token,
    /// Number of slot lists holding this entry. Guarded by the cache lock;
    /// atomic only so entries can be shared as `Arc<CacheEntry>`.
    refs: AtomicU32,
}

impl CacheEntry {
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Ordered entry list of one cache slot: a contiguous KV prefix
/// `[0, last_pos)` plus an LRU timestamp.
struct SlotEntries {
    entries: Vec<Arc<CacheEntry>>,
    last_pos: i32,
    last_access: Instant,
}

impl SlotEntries {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_pos: 0,
            last_access: Instant::now(),
        }
    }
}

struct CacheState {
    /// Hashes currently being built.
    wait_set: HashSet<u64>,
    /// Global hash → entry index.
    map: HashMap<u64, Arc<CacheEntry>>,
    /// One list per reserved slot. BTreeMap keeps slot iteration
    /// deterministic, which makes eviction order reproducible.
    slots: BTreeMap<SeqId, SlotEntries>,
}

pub struct ChunkInferCache {
    memory: Arc<MemoryScheduler>,
    state: Mutex<CacheState>,
    stored_cv: Condvar,
}

impl ChunkInferCache {
    /// `cache_slots` are the reserved sequence ids `[active_max, seq_max)`.
    pub fn new(memory: Arc<MemoryScheduler>, cache_slots: impl IntoIterator<Item = SeqId>) -> Self {
        let slots: BTreeMap<SeqId, SlotEntries> = cache_slots
            .into_iter()
            .map(|id| (id, SlotEntries::new()))
            .collect();
        info!(slots = slots.len(), "chunk infer cache initialized");
        Self {
            memory,
            state: Mutex::new(CacheState {
                wait_set: HashSet::new(),
                map: HashMap::new(),
                slots,
            }),
            stored_cv: Condvar::new(),
        }
    }

    /// Claim the right to build `hash`. False when the hash is already
    /// in-flight or stored.
    pub fn prepare(&self, hash: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.wait_set.contains(&hash) || state.map.contains_key(&hash) {
            return false;
        }
        state.wait_set.insert(hash);
        true
    }

    /// Release a failed build claim and wake waiters.
    pub fn unprepared(&self, hash: u64) {
        let mut state = self.state.lock().unwrap();
        state.wait_set.remove(&hash);
        drop(state);
        self.stored_cv.notify_all();
    }

    /// Wait for any outstanding build of `hash` to settle, then claim the
    /// build if the hash is still not stored.
    ///
    /// Post-condition: either the hash is stored (check with
    /// [`storing`](Self::storing)) or this caller holds the build claim.
    /// Only one caller at a time can hold it: a second waiter waking after
    /// the first re-claimed goes back to sleep.
    pub fn block_waiting_and_prepare(&self, hash: u64) {
        let state = self.state.lock().unwrap();
        let mut state = self
            .stored_cv
            .wait_while(state, |s| s.wait_set.contains(&hash))
            .unwrap();
        if !state.map.contains_key(&hash) {
            state.wait_set.insert(hash);
        }
    }

    pub fn waiting(&self, hash: u64) -> bool {
        self.state.lock().unwrap().wait_set.contains(&hash)
    }

    pub fn storing(&self, hash: u64) -> bool {
        self.state.lock().unwrap().map.contains_key(&hash)
    }

    /// Stored entry for `hash`, touching the LRU stamp of every slot that
    /// holds it.
    pub fn lookup(&self, hash: u64) -> Option<Arc<CacheEntry>> {
        let mut state = self.state.lock().unwrap();
        let entry = state.map.get(&hash).cloned()?;
        let now = Instant::now();
        for slot in state.slots.values_mut() {
            if slot.entries.iter().any(|e| Arc::ptr_eq(e, &entry)) {
                slot.last_access = now;
            }
        }
        Some(entry)
    }

    /// Re-home `entry`'s KV prefix into `target_seq_id`: find the slot
    /// holding the entry and queue a copy of positions `[0, pos_end)`.
    /// False when no slot holds the entry (it was evicted).
    pub fn apply_cache_entry(&self, entry: &Arc<CacheEntry>, target_seq_id: SeqId) -> bool {
        let state = self.state.lock().unwrap();
        let src = state.slots.iter().find_map(|(&id, slot)| {
            slot.entries
                .iter()
                .any(|e| Arc::ptr_eq(e, entry))
                .then_some(id)
        });
        drop(state);

        match src {
            Some(src_seq_id) => {
                self.memory.copy(src_seq_id, target_seq_id, 0, entry.pos_end);
                true
            }
            None => false,
        }
    }

    /// Publish chunk `i` of a request into the cache.
    ///
    /// `hashes` are the request's prefix hashes, `src_seq_id` the active
    /// slot whose KV holds the freshly decoded positions, `last_token` /
    /// `n_past` the sequence state after the chunk settled. Picks a slot
    /// that already ends with the longest cached prefix of `hashes[0..=i]`
    /// (appending only the new positions), falling back to an empty slot.
    /// Returns false when no slot is available; the chunk itself stays
    /// valid, the cache just misses out.
    pub fn store(
        &self,
        hashes: &[u64],
        i: usize,
        src_seq_id: SeqId,
        last_token: Token,
        n_past: i32,
    ) -> bool {
        self.maintain();

        let mut state = self.state.lock().unwrap();
        state.wait_set.remove(&hashes[i]);
        self.stored_cv.notify_all();

        // Cached entries covering a prefix of hashes[0..=i].
        let mut pre_entries: Vec<Arc<CacheEntry>> = Vec::new();
        let mut pre_indices: Vec<usize> = Vec::new();
        for (idx, hash) in hashes[..=i].iter().enumerate() {
            if let Some(entry) = state.map.get(hash) {
                pre_entries.push(Arc::clone(entry));
                pre_indices.push(idx);
            }
        }

        if pre_indices.last() == Some(&i) {
            return true; // already cached
        }

        // Prefer the slot whose list ends with the last cached prefix
        // entry; otherwise any empty slot.
        let mut target: Option<SeqId> = None;
        if let Some(prefix_tail) = pre_entries.last() {
            for (&id, slot) in &state.slots {
                if let Some(tail) = slot.entries.last() {
                    if Arc::ptr_eq(tail, prefix_tail) {
                        target = Some(id);
                    }
                }
            }
        }
        if target.is_none() {
            target = state
                .slots
                .iter()
                .find(|(_, slot)| slot.entries.is_empty())
                .map(|(&id, _)| id);
        }
        let Some(target_id) = target else {
            warn!(hash = hashes[i], "no cache slot available, not storing");
            return false;
        };

        let entry = Arc::new(CacheEntry {
            prompt_hash: hashes[i],
            pos_begin: pre_entries.last().map_or(0, |e| e.pos_end),
            pos_end: n_past,
            last_token,
            refs: AtomicU32::new(1),
        });

        let slot = state.slots.get_mut(&target_id).expect("slot exists");
        // Append only the freshly produced positions to the slot's KV.
        self.memory.copy(src_seq_id, target_id, slot.last_pos, -1);

        if slot.entries.is_empty() {
            for e in &pre_entries {
                e.refs.fetch_add(1, Ordering::AcqRel);
            }
            slot.entries.extend(pre_entries);
            slot.entries.push(Arc::clone(&entry));
        } else {
            slot.entries.push(Arc::clone(&entry));
        }
        slot.last_pos = n_past;
        slot.last_access = Instant::now();
        state.map.insert(hashes[i], entry);

        info!(
            hash = hashes[i],
            slot = target_id,
            n_past,
            "stored chunk KV entry"
        );
        true
    }

    /// Evict least-recently-accessed slots when every slot is occupied,
    /// down to 80% occupancy. Evicted slots drop their entry refs (erasing
    /// hashes whose refcount reaches zero) and get their KV cleared.
    fn maintain(&self) {
        let mut state = self.state.lock().unwrap();

        let total = state.slots.len();
        let used = state
            .slots
            .values()
            .filter(|s| !s.entries.is_empty())
            .count();
        if used < total {
            return;
        }
        let target = (total as f64 * OCCUPANCY_TARGET) as usize;
        let evict_count = used.saturating_sub(target).max(1);

        let mut occupied: Vec<(SeqId, Instant)> = state
            .slots
            .iter()
            .filter(|(_, slot)| !slot.entries.is_empty())
            .map(|(&id, slot)| (id, slot.last_access))
            .collect();
        occupied.sort_by_key(|&(_, access)| access);

        for &(slot_id, _) in occupied.iter().take(evict_count) {
            let slot = state.slots.get_mut(&slot_id).expect("slot exists");
            let entries = std::mem::take(&mut slot.entries);
            slot.last_pos = 0;

            let mut dead_hashes = Vec::new();
            for entry in entries {
                if entry.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                    dead_hashes.push(entry.prompt_hash);
                }
            }
            for hash in dead_hashes {
                state.map.remove(&hash);
            }

            self.memory.clear(slot_id, -1, -1);
            info!(slot = slot_id, "evicted cache slot");
        }
    }

    /// Number of slots currently holding entries.
    pub fn occupied_slots(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .slots
            .values()
            .filter(|s| !s.entries.is_empty())
            .count()
    }

    /// Number of published hashes.
    pub fn stored_hashes(&self) -> usize {
        self.state.lock().unwrap().map.len()
    }
}
