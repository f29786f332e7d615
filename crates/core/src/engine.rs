//! Engine facade: the request surface over the scheduling core.
//!
//! One [`Engine`] owns the three workers (batcher, encoder, memory) and
//! the shared context. A session is one chat-completion id: `prompt`
//! claims an active sequence slot and runs the full chunked prompt, each
//! `generate` decodes one more token, and the session ends on
//! end-of-generation, an explicit stop, or a fatal error; at that point
//! the slot's KV is cleared and the slot returns to the pool.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::chunk::ChunkPayload;
use crate::config::EngineConfig;
use crate::context::{AdmitReject, EngineContext};
use crate::memory::MemoryScheduler;
use crate::request::{GenerateRequest, InferRequest, SeqState, StepOutput};
use crate::runtime::{ModelRuntime, SeqId};
use crate::scheduler::BatchScheduler;

/// Prompts are cropped to this share of the per-sequence context budget.
const PROMPT_PROPORTION_LIMIT: f64 = 0.8;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("excessive concurrent requests")]
    TooManyRequests,
    #[error("chat completion {0} already has a running request")]
    AlreadyInfering(u64),
    #[error("chat completion {0} is not infering, request a prompt first")]
    NotInfering(u64),
    #[error("request has no chunks")]
    EmptyPrompt,
    #[error("inference failed for chat completion {0}")]
    InferFailed(u64),
}

pub struct Engine {
    context: Arc<EngineContext>,
    memory: Arc<MemoryScheduler>,
    scheduler: BatchScheduler,
    context_per_seq: usize,
}

impl Engine {
    /// Build the engine over an already-initialized model runtime.
    ///
    /// Validates the config, partitions the runtime's sequence pool into
    /// active and cache slots, and starts the three workers.
    pub fn new(config: EngineConfig, runtime: Arc<dyn ModelRuntime>) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;
        let seq_max = runtime.max_sequences();
        if config.cache_seq_num >= seq_max {
            return Err(EngineError::Config(format!(
                "cache_seq_num {} must be smaller than the runtime's {} sequences",
                config.cache_seq_num, seq_max
            )));
        }

        let context = Arc::new(EngineContext::new(
            runtime,
            config.n_batch(),
            config.cache_seq_num,
        ));
        let memory = Arc::new(MemoryScheduler::new(Arc::clone(&context.runtime)));
        let scheduler = BatchScheduler::new(
            Arc::clone(&context),
            Arc::clone(&memory),
            Duration::from_millis(config.batch_time_wait_ms),
        );

        info!(
            active_slots = context.active_max,
            cache_slots = context.seq_max - context.active_max,
            n_batch = context.n_batch,
            "engine initialized"
        );

        Ok(Self {
            context,
            memory,
            scheduler,
            context_per_seq: config.context_per_seq,
        })
    }

    /// Convenience constructor from the init JSON blob.
    pub fn from_json(config_json: &str, runtime: Arc<dyn ModelRuntime>) -> Result<Self, EngineError> {
        let config = EngineConfig::from_json(config_json)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Self::new(config, runtime)
    }

    fn crop_budget(&self) -> usize {
        (self.context_per_seq as f64 * PROMPT_PROPORTION_LIMIT) as usize
    }

    /// First round of a session: run the full chunked prompt.
    pub fn prompt(&self, request: InferRequest) -> Result<StepOutput, EngineError> {
        if request.chunks.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        let seq_id = self.context.try_admit(request.cmpl_id).map_err(|reject| {
            error!(cmpl_id = request.cmpl_id, ?reject, "request not admitted");
            match reject {
                AdmitReject::NoFreeSlot => EngineError::TooManyRequests,
                AdmitReject::AlreadyActive => EngineError::AlreadyInfering(request.cmpl_id),
            }
        })?;
        let state = self.context.seq_state(seq_id);

        let chunks = crop_from_tail(request.chunks, self.crop_budget());
        if chunks.is_empty() {
            self.finish_sequence(seq_id, &state);
            return Err(EngineError::EmptyPrompt);
        }

        self.scheduler
            .blocking_infer(chunks, seq_id, request.priority);
        self.step_output(request.cmpl_id, seq_id, &state)
    }

    /// Continuation round: decode one token from the previous `last_token`.
    ///
    /// A request carrying `stop` ends the session without decoding.
    pub fn generate(&self, request: GenerateRequest) -> Result<StepOutput, EngineError> {
        let seq_id = self
            .context
            .slot_for(request.cmpl_id)
            .ok_or(EngineError::NotInfering(request.cmpl_id))?;
        let state = self.context.seq_state(seq_id);
        if !state.is_infering.load(Ordering::Acquire) {
            return Err(EngineError::NotInfering(request.cmpl_id));
        }

        if request.stop {
            self.finish_sequence(seq_id, &state);
            return Ok(StepOutput {
                content: String::new(),
                is_finished: true,
            });
        }

        let last_token = state.last_token.load(Ordering::Acquire);
        self.scheduler
            .blocking_infer(vec![ChunkPayload::Text(vec![last_token])], seq_id, 0);
        self.step_output(request.cmpl_id, seq_id, &state)
    }

    /// Shared tail of both rounds: inspect `last_token`, finish or
    /// continue the session, and detokenize.
    fn step_output(
        &self,
        cmpl_id: u64,
        seq_id: SeqId,
        state: &Arc<SeqState>,
    ) -> Result<StepOutput, EngineError> {
        let token = state.last_token.load(Ordering::Acquire);
        if token < 0 {
            self.finish_sequence(seq_id, state);
            return Err(EngineError::InferFailed(cmpl_id));
        }
        if self.context.runtime.is_end_of_generation(token) {
            self.finish_sequence(seq_id, state);
            return Ok(StepOutput {
                content: String::new(),
                is_finished: true,
            });
        }
        let content = self.context.runtime.detokenize(token);
        state.set_response(content.clone());
        Ok(StepOutput {
            content,
            is_finished: false,
        })
    }

    /// End a session: clear the slot's KV, release the slot.
    fn finish_sequence(&self, seq_id: SeqId, state: &Arc<SeqState>) {
        state.reset();
        self.memory.clear(seq_id, -1, -1);
        self.context.release_slot(seq_id);
    }

    /// Stop all workers. Queued KV work is flushed first so released
    /// slots are actually clean. Runs on `Drop` as well.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.memory.flush();
        self.memory.shutdown();
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Crop an over-long prompt from the tail: keep whole suffix chunks while
/// the budget lasts, keep the tail tokens of the boundary text chunk, and
/// discard a straddling image chunk whole (with everything before it).
fn crop_from_tail(chunks: Vec<ChunkPayload>, limit: usize) -> Vec<ChunkPayload> {
    let total: usize = chunks.iter().map(ChunkPayload::n_tokens).sum();
    if total <= limit {
        return chunks;
    }
    info!(total, limit, "prompt over budget, cropping from tail");

    let mut kept: VecDeque<ChunkPayload> = VecDeque::new();
    let mut remaining = limit;
    for chunk in chunks.into_iter().rev() {
        if remaining == 0 {
            break;
        }
        match chunk {
            ChunkPayload::Text(tokens) => {
                let keep = tokens.len().min(remaining);
                if keep > 0 {
                    kept.push_front(ChunkPayload::Text(tokens[tokens.len() - keep..].to_vec()));
                    remaining -= keep;
                }
            }
            ChunkPayload::Image(image) => {
                if image.n_tokens as usize <= remaining {
                    remaining -= image.n_tokens as usize;
                    kept.push_front(ChunkPayload::Image(image));
                } else {
                    break;
                }
            }
        }
    }
    kept.into()
}
