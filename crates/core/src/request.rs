//! Request-level types: per-sequence state and the request surface structs.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::chunk::ChunkPayload;
use crate::runtime::Token;

/// Chat-completion id assigned by the caller; mapped to a sequence slot
/// for the lifetime of the session.
pub type CmplId = u64;

/// Sentinel stored in `last_token` while a decode is outstanding or after
/// a failure.
pub const TOKEN_FAILED: Token = -1;

/// Stored in `last_token` by decode steps that produced no sampled token
/// (non-logits positions, image decode).
pub const TOKEN_NONE: Token = 0;

/// Mutable per-slot state, shared across the request thread and the three
/// workers. Scalar fields are atomics because the LLM worker writes them
/// while the request thread polls.
#[derive(Debug)]
pub struct SeqState {
    /// Last sampled token; `-1` failure, `0` no token this step.
    pub last_token: AtomicI32,
    /// Tokens committed to this slot's KV.
    pub n_past: AtomicU32,
    /// True while a request owns this slot.
    pub is_infering: AtomicBool,
    /// Text produced by the latest round, kept alive for the caller.
    response: Mutex<String>,
}

impl SeqState {
    pub fn new() -> Self {
        Self {
            last_token: AtomicI32::new(TOKEN_FAILED),
            n_past: AtomicU32::new(0),
            is_infering: AtomicBool::new(false),
            response: Mutex::new(String::new()),
        }
    }

    pub fn set_response(&self, text: String) {
        *self.response.lock().unwrap() = text;
    }

    pub fn response(&self) -> String {
        self.response.lock().unwrap().clone()
    }

    /// Reset for slot release: the slot may be handed to another request.
    pub fn reset(&self) {
        self.is_infering.store(false, Ordering::Release);
        self.n_past.store(0, Ordering::Release);
    }
}

impl Default for SeqState {
    fn default() -> Self {
        Self::new()
    }
}

/// First round of a session: the full chunked prompt.
#[derive(Debug)]
pub struct InferRequest {
    pub cmpl_id: CmplId,
    /// Lower value = served first.
    pub priority: i32,
    pub chunks: Vec<ChunkPayload>,
}

/// Continuation round: decodes one token (the previous `last_token`).
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest {
    pub cmpl_id: CmplId,
    /// Ends the session without decoding.
    pub stop: bool,
}

/// Result of a prompt or generate round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// Detokenized text of the sampled token; empty on end of generation.
    pub content: String,
    /// True when the session ended (end-of-generation or explicit stop).
    pub is_finished: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_failure_sentinel() {
        let state = SeqState::new();
        assert_eq!(state.last_token.load(Ordering::Acquire), TOKEN_FAILED);
        assert_eq!(state.n_past.load(Ordering::Acquire), 0);
        assert!(!state.is_infering.load(Ordering::Acquire));
    }

    #[test]
    fn reset_clears_occupancy_but_keeps_token() {
        let state = SeqState::new();
        state.is_infering.store(true, Ordering::Release);
        state.n_past.store(17, Ordering::Release);
        state.last_token.store(42, Ordering::Release);

        state.reset();

        assert!(!state.is_infering.load(Ordering::Acquire));
        assert_eq!(state.n_past.load(Ordering::Acquire), 0);
        assert_eq!(state.last_token.load(Ordering::Acquire), 42);
    }

    #[test]
    fn response_roundtrip() {
        let state = SeqState::new();
        assert_eq!(state.response(), "");
        state.set_response("hello".to_string());
        assert_eq!(state.response(), "hello");
    }
}
