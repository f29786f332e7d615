//! Shared engine context: the runtime handle, the sequence-state table and
//! the chat-completion → slot mapping.
//!
//! The runtime's sequence pool `[0, seq_max)` is partitioned into active
//! slots `[0, active_max)` (one per in-flight request) and cache slots
//! `[active_max, seq_max)` owned by the chunk KV cache.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::request::{CmplId, SeqState};
use crate::runtime::{ModelRuntime, SeqId};

/// Why a request could not be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitReject {
    /// All active slots are busy.
    NoFreeSlot,
    /// This chat-completion id already has a running session.
    AlreadyActive,
}

pub struct EngineContext {
    pub runtime: Arc<dyn ModelRuntime>,
    /// Decode batch capacity.
    pub n_batch: usize,
    /// Active slots are `[0, active_max)`.
    pub active_max: SeqId,
    /// Total slots the runtime exposes.
    pub seq_max: SeqId,
    seq_states: Mutex<HashMap<SeqId, Arc<SeqState>>>,
    cmpl_to_seq: Mutex<HashMap<CmplId, SeqId>>,
}

impl EngineContext {
    pub fn new(runtime: Arc<dyn ModelRuntime>, n_batch: usize, cache_slots: u32) -> Self {
        let seq_max = runtime.max_sequences();
        debug_assert!(cache_slots < seq_max);
        Self {
            runtime,
            n_batch,
            active_max: seq_max - cache_slots,
            seq_max,
            seq_states: Mutex::new(HashMap::new()),
            cmpl_to_seq: Mutex::new(HashMap::new()),
        }
    }

    /// State for a slot, created lazily on first use and kept for the
    /// engine's lifetime.
    pub fn seq_state(&self, seq_id: SeqId) -> Arc<SeqState> {
        let mut states = self.seq_states.lock().unwrap();
        Arc::clone(states.entry(seq_id).or_default())
    }

    /// Claim the first free active slot for `cmpl_id`, marking it busy.
    ///
    /// The claim happens under the mapping lock so two concurrent prompts
    /// can never be handed the same slot.
    pub fn try_admit(&self, cmpl_id: CmplId) -> Result<SeqId, AdmitReject> {
        let mut map = self.cmpl_to_seq.lock().unwrap();
        if let Some(&existing) = map.get(&cmpl_id) {
            if self.seq_state(existing).is_infering.load(Ordering::Acquire) {
                return Err(AdmitReject::AlreadyActive);
            }
        }
        for seq_id in 0..self.active_max {
            let state = self.seq_state(seq_id);
            if !state.is_infering.swap(true, Ordering::AcqRel) {
                map.insert(cmpl_id, seq_id);
                return Ok(seq_id);
            }
        }
        Err(AdmitReject::NoFreeSlot)
    }

    /// Slot currently serving `cmpl_id`, if any.
    pub fn slot_for(&self, cmpl_id: CmplId) -> Option<SeqId> {
        self.cmpl_to_seq.lock().unwrap().get(&cmpl_id).copied()
    }

    /// Drop the mapping that points at `seq_id`.
    pub fn release_slot(&self, seq_id: SeqId) {
        let mut map = self.cmpl_to_seq.lock().unwrap();
        map.retain(|_, &mut s| s != seq_id);
    }

    /// Number of active slots currently marked busy.
    pub fn active_count(&self) -> usize {
        (0..self.active_max)
            .filter(|&s| self.seq_state(s).is_infering.load(Ordering::Acquire))
            .count()
    }
}
