//! Decode-job dispatch through the memory worker.
//!
//! Every decode call mutates KV, so jobs are enqueued on the
//! [`MemoryScheduler`](crate::memory::MemoryScheduler) and interleave with
//! KV clears/copies in one total order. This scheduler's own state is the
//! per-sequence count of un-settled jobs; request threads block on it
//! before inspecting `last_token`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::{debug, error};

use crate::chunk::ChunkTask;
use crate::context::EngineContext;
use crate::memory::MemoryScheduler;
use crate::request::{TOKEN_FAILED, TOKEN_NONE};
use crate::runtime::{SeqId, TokenBatch};

struct RunningSet {
    counts: Mutex<HashMap<SeqId, u32>>,
    finish_cv: Condvar,
}

impl RunningSet {
    fn add(&self, seq_id: SeqId) {
        *self.counts.lock().unwrap().entry(seq_id).or_insert(0) += 1;
    }

    fn settle(&self, seq_id: SeqId) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(&seq_id) {
            *count = count.saturating_sub(1);
        }
        drop(counts);
        self.finish_cv.notify_all();
    }
}

pub struct LlmScheduler {
    context: Arc<EngineContext>,
    memory: Arc<MemoryScheduler>,
    running: Arc<RunningSet>,
}

impl LlmScheduler {
    pub fn new(context: Arc<EngineContext>, memory: Arc<MemoryScheduler>) -> Self {
        Self {
            context,
            memory,
            running: Arc::new(RunningSet {
                counts: Mutex::new(HashMap::new()),
                finish_cv: Condvar::new(),
            }),
        }
    }

    /// Queue a packed text batch for decode.
    ///
    /// On success every logits-bearing position gets a sampled token stored
    /// into its sequence's `last_token` (and fed back to the sampler);
    /// non-logits positions store `0`. On failure every referenced sequence
    /// gets `-1`.
    pub fn submit_token_infer(&self, batch: TokenBatch) {
        for i in 0..batch.len() {
            self.running.add(batch.seq_id(i));
        }

        let context = Arc::clone(&self.context);
        let running = Arc::clone(&self.running);
        self.memory.submit(move || {
            let started = Instant::now();
            match context.runtime.decode_tokens(&batch) {
                Ok(()) => {
                    for i in 0..batch.len() {
                        let state = context.seq_state(batch.seq_id(i));
                        if batch.wants_logits(i) {
                            let token = context.runtime.sample(i);
                            context.runtime.accept(token);
                            state.last_token.store(token, Ordering::Release);
                        } else {
                            state.last_token.store(TOKEN_NONE, Ordering::Release);
                        }
                    }
                    debug!(
                        n_tokens = batch.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "text batch decoded"
                    );
                }
                Err(err) => {
                    error!(%err, n_tokens = batch.len(), "text decode failed");
                    for i in 0..batch.len() {
                        context
                            .seq_state(batch.seq_id(i))
                            .last_token
                            .store(TOKEN_FAILED, Ordering::Release);
                    }
                }
            }
            for i in 0..batch.len() {
                running.settle(batch.seq_id(i));
            }
        });
    }

    /// Queue an image decode: feeds a precomputed embedding into `seq_id`'s
    /// KV starting at its current `n_past`.
    pub fn submit_embedding_infer(
        &self,
        chunk: &Arc<ChunkTask>,
        embedding: Arc<Vec<f32>>,
        seq_id: SeqId,
    ) {
        self.running.add(seq_id);

        let context = Arc::clone(&self.context);
        let running = Arc::clone(&self.running);
        let chunk = Arc::clone(chunk);
        self.memory.submit(move || {
            let state = context.seq_state(seq_id);
            let past = state.n_past.load(Ordering::Acquire);
            let result = match chunk.payload.as_image() {
                Some(image) => context.runtime.decode_image(
                    image,
                    &embedding,
                    past,
                    seq_id,
                    context.n_batch,
                ),
                None => {
                    // Only image chunks reach the embedding path.
                    running.settle(seq_id);
                    return;
                }
            };
            match result {
                Ok(new_past) => {
                    state.n_past.store(new_past, Ordering::Release);
                    state.last_token.store(TOKEN_NONE, Ordering::Release);
                }
                Err(err) => {
                    error!(%err, seq_id, "image decode failed");
                    state.last_token.store(TOKEN_FAILED, Ordering::Release);
                }
            }
            running.settle(seq_id);
        });
    }

    /// Block until no submitted job still references `seq_id`.
    pub fn block_waiting_seq(&self, seq_id: SeqId) {
        let counts = self.running.counts.lock().unwrap();
        let _guard = self
            .running
            .finish_cv
            .wait_while(counts, |c| c.get(&seq_id).copied().unwrap_or(0) > 0)
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::chunk::ChunkPayload;
    use crate::runtime::{ImageData, ModelRuntime};
    use crate::testing::MockRuntime;

    fn setup(seqs: u32) -> (Arc<MockRuntime>, Arc<EngineContext>, Arc<MemoryScheduler>, LlmScheduler)
    {
        let runtime = Arc::new(MockRuntime::new(seqs));
        let context = Arc::new(EngineContext::new(
            Arc::clone(&runtime) as Arc<dyn ModelRuntime>,
            64,
            0,
        ));
        let memory = Arc::new(MemoryScheduler::new(
            Arc::clone(&runtime) as Arc<dyn ModelRuntime>
        ));
        let llm = LlmScheduler::new(Arc::clone(&context), Arc::clone(&memory));
        (runtime, context, memory, llm)
    }

    #[test]
    fn token_infer_samples_on_logits_positions() {
        let (runtime, context, _memory, llm) = setup(2);
        let mut batch = TokenBatch::new(8);
        batch.push(10, 0, 0, false);
        batch.push(11, 1, 0, true);

        llm.submit_token_infer(batch);
        llm.block_waiting_seq(0);

        let state = context.seq_state(0);
        let token = state.last_token.load(Ordering::Acquire);
        assert!(token > 0, "logits position should yield a sampled token");
        assert_eq!(runtime.decode_calls(), 1);
        assert_eq!(runtime.accepted_tokens(), vec![token]);
    }

    #[test]
    fn non_logits_batch_stores_zero() {
        let (_runtime, context, _memory, llm) = setup(2);
        let mut batch = TokenBatch::new(8);
        batch.push(10, 0, 1, false);

        llm.submit_token_infer(batch);
        llm.block_waiting_seq(1);

        assert_eq!(
            context.seq_state(1).last_token.load(Ordering::Acquire),
            TOKEN_NONE
        );
    }

    #[test]
    fn decode_failure_marks_all_sequences() {
        let (runtime, context, _memory, llm) = setup(2);
        runtime.fail_decode_on_call(1);

        let mut batch = TokenBatch::new(8);
        batch.push(10, 0, 0, true);
        batch.push(20, 0, 1, true);

        llm.submit_token_infer(batch);
        llm.block_waiting_seq(0);
        llm.block_waiting_seq(1);

        assert_eq!(
            context.seq_state(0).last_token.load(Ordering::Acquire),
            TOKEN_FAILED
        );
        assert_eq!(
            context.seq_state(1).last_token.load(Ordering::Acquire),
            TOKEN_FAILED
        );
    }

    #[test]
    fn embedding_infer_advances_n_past() {
        let (runtime, context, _memory, llm) = setup(2);
        let image = ImageData {
            image_id: "img".to_string(),
            n_tokens: 6,
            bitmap: Arc::new(Vec::new()),
        };
        let chunk = Arc::new(ChunkTask::new(
            ChunkPayload::Image(image),
            0,
            0,
            false,
        ));
        let embedding = Arc::new(vec![0.0f32; 6 * MockRuntime::EMBED_DIM]);

        llm.submit_embedding_infer(&chunk, embedding, 0);
        llm.block_waiting_seq(0);

        let state = context.seq_state(0);
        assert_eq!(state.n_past.load(Ordering::Acquire), 6);
        assert_eq!(state.last_token.load(Ordering::Acquire), TOKEN_NONE);
        assert_eq!(runtime.image_decode_calls(), 1);
    }

    #[test]
    fn block_waiting_seq_returns_immediately_when_idle() {
        let (_runtime, _context, _memory, llm) = setup(2);
        llm.block_waiting_seq(0);
    }
}
