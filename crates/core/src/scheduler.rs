//! Per-request chunk pipeline and the batching loop.
//!
//! [`BatchScheduler::blocking_infer`] walks a request's chunks in order:
//! image chunks are pre-submitted to the encoder, non-final chunks consult
//! the chunk KV cache (a hit re-homes cached KV and skips decode), misses
//! go into a shared priority queue. A dedicated thread drains that queue
//! into a text buffer and an image buffer, and flushes each when it
//! reaches a size threshold or has waited long enough, trading a bounded amount of
//! latency for batched decode calls.
//!
//! Buffer thresholds: text flushes at 512 tokens, images immediately
//! (the runtime decodes one embedding at a time). Both also flush
//! `time_wait` after their first pending chunk arrived.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::chunk::{prefix_hashes, ChunkPayload, ChunkStatus, ChunkTask};
use crate::context::EngineContext;
use crate::encoder::EncoderScheduler;
use crate::kv_cache::ChunkInferCache;
use crate::llm::LlmScheduler;
use crate::memory::MemoryScheduler;
use crate::runtime::{SeqId, TokenBatch};

/// Tokens buffered before a text flush happens regardless of `time_wait`.
const TEXT_BATCH_SIZE: usize = 512;
/// Images are never batched.
const IMAGE_BATCH_SIZE: usize = 1;

/// Heap entry: lower priority value pops first, ties pop in submission
/// order.
struct QueuedChunk {
    priority: i32,
    submitted: u64,
    chunk: Arc<ChunkTask>,
}

impl PartialEq for QueuedChunk {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.submitted == other.submitted
    }
}

impl Eq for QueuedChunk {}

impl PartialOrd for QueuedChunk {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedChunk {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: reverse both fields so the smallest (priority,
        // submitted) pair is at the top.
        match other.priority.cmp(&self.priority) {
            std::cmp::Ordering::Equal => other.submitted.cmp(&self.submitted),
            ordering => ordering,
        }
    }
}

struct SchedulerShared {
    context: Arc<EngineContext>,
    queue: Mutex<BinaryHeap<QueuedChunk>>,
    /// Wakes the batching loop on new work or stop.
    task_cv: Condvar,
    /// Wakes request threads when their chunk leaves WAIT/PENDING.
    finish_cv: Condvar,
    stop: AtomicBool,
    time_wait: Duration,
}

pub struct BatchScheduler {
    shared: Arc<SchedulerShared>,
    encoder: Arc<EncoderScheduler>,
    llm: Arc<LlmScheduler>,
    cache: Option<Arc<ChunkInferCache>>,
    submit_counter: AtomicU64,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BatchScheduler {
    pub fn new(
        context: Arc<EngineContext>,
        memory: Arc<MemoryScheduler>,
        time_wait: Duration,
    ) -> Self {
        let encoder = Arc::new(EncoderScheduler::new(Arc::clone(&context.runtime)));
        let llm = Arc::new(LlmScheduler::new(Arc::clone(&context), Arc::clone(&memory)));
        let cache = (context.active_max < context.seq_max).then(|| {
            Arc::new(ChunkInferCache::new(
                Arc::clone(&memory),
                context.active_max..context.seq_max,
            ))
        });

        let shared = Arc::new(SchedulerShared {
            context,
            queue: Mutex::new(BinaryHeap::new()),
            task_cv: Condvar::new(),
            finish_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            time_wait,
        });

        let loop_shared = Arc::clone(&shared);
        let loop_llm = Arc::clone(&llm);
        let handle = thread::Builder::new()
            .name("batcher".to_string())
            .spawn(move || batching_loop(loop_shared, loop_llm))
            .expect("failed to spawn batcher");

        Self {
            shared,
            encoder,
            llm,
            cache,
            submit_counter: AtomicU64::new(0),
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn chunk_cache(&self) -> Option<&Arc<ChunkInferCache>> {
        self.cache.as_ref()
    }

    pub fn encoder(&self) -> &Arc<EncoderScheduler> {
        &self.encoder
    }

    /// Run a request's chunk list to completion on the caller's thread.
    ///
    /// On return the sequence's `last_token` holds the sampled token of the
    /// final chunk, or `-1` if any chunk failed.
    pub fn blocking_infer(&self, payloads: Vec<ChunkPayload>, seq_id: SeqId, priority: i32) {
        let n_chunks = payloads.len();
        let hashes = prefix_hashes(payloads.iter());
        let tasks: Vec<Arc<ChunkTask>> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                Arc::new(ChunkTask::new(payload, seq_id, priority, i + 1 == n_chunks))
            })
            .collect();

        // Pre-submit encodes so the encoder overlaps with earlier chunks.
        for task in &tasks {
            if task.payload.is_image() {
                self.encoder.submit_encoder_task(task);
            }
        }

        let state = self.shared.context.seq_state(seq_id);
        for (i, chunk) in tasks.iter().enumerate() {
            let hash = hashes[i];
            let cacheable = !chunk.is_last_chunk;

            if let (Some(cache), true) = (&self.cache, cacheable) {
                cache.block_waiting_and_prepare(hash);
                if cache.storing(hash) {
                    if let Some(entry) = cache.lookup(hash) {
                        if cache.apply_cache_entry(&entry, seq_id) {
                            chunk.set_status(ChunkStatus::Completed);
                            state.last_token.store(entry.last_token, Ordering::Release);
                            state.n_past.store(entry.pos_end as u32, Ordering::Release);
                            continue;
                        }
                    }
                }
            }

            if chunk.payload.is_image() {
                match self.encoder.wait_for_result(chunk) {
                    Some(embedding) => chunk.set_embedding(embedding),
                    None => {
                        error!(seq_id, "encoder embedding failed");
                        chunk.set_status(ChunkStatus::Failed);
                        state.last_token.store(-1, Ordering::Release);
                        if let Some(cache) = &self.cache {
                            cache.unprepared(hash);
                        }
                        break;
                    }
                }
            }

            // Hand the chunk to the batching loop and wait for it to be
            // flushed into a decode batch.
            {
                let mut queue = self.shared.queue.lock().unwrap();
                chunk.set_status(ChunkStatus::Pending);
                queue.push(QueuedChunk {
                    priority,
                    submitted: self.submit_counter.fetch_add(1, Ordering::Relaxed),
                    chunk: Arc::clone(chunk),
                });
                self.shared.task_cv.notify_one();
                let _guard = self
                    .shared
                    .finish_cv
                    .wait_while(queue, |_| chunk.status().is_unflushed())
                    .unwrap();
            }

            // Wait for every decode referencing this sequence to settle.
            self.llm.block_waiting_seq(seq_id);

            let last_token = state.last_token.load(Ordering::Acquire);
            let n_past = state.n_past.load(Ordering::Acquire);
            if last_token < 0 {
                chunk.set_status(ChunkStatus::Failed);
                if let Some(cache) = &self.cache {
                    cache.unprepared(hash);
                }
                break;
            }
            chunk.set_status(ChunkStatus::Completed);
            if let (Some(cache), true) = (&self.cache, cacheable) {
                cache.store(&hashes, i, seq_id, last_token, n_past as i32);
            }
        }
    }

    /// Stop the batching loop after its current wakeup. Chunks still
    /// queued are failed so their waiting requests resolve. Idempotent.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.task_cv.notify_one();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.encoder.shutdown();

        let mut queue = self.shared.queue.lock().unwrap();
        for queued in queue.drain() {
            queued.chunk.set_status(ChunkStatus::Failed);
        }
        self.shared.finish_cv.notify_all();
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn batching_loop(shared: Arc<SchedulerShared>, llm: Arc<LlmScheduler>) {
    let mut text_buffer: Vec<Arc<ChunkTask>> = Vec::new();
    let mut image_buffer: Vec<Arc<ChunkTask>> = Vec::new();
    let mut last_text = Instant::now();
    let mut last_image = Instant::now();
    let mut text_tokens = 0usize;
    let mut image_tokens = 0usize;

    loop {
        let mut queue = shared.queue.lock().unwrap();
        if text_buffer.is_empty() && image_buffer.is_empty() {
            queue = shared
                .task_cv
                .wait_while(queue, |q| {
                    q.is_empty() && !shared.stop.load(Ordering::Acquire)
                })
                .unwrap();
        } else {
            let now = Instant::now();
            let mut waited = Duration::ZERO;
            if !text_buffer.is_empty() {
                waited = waited.max(now.duration_since(last_text));
            }
            if !image_buffer.is_empty() {
                waited = waited.max(now.duration_since(last_image));
            }
            let remaining = shared.time_wait.saturating_sub(waited);
            let (guard, _) = shared
                .task_cv
                .wait_timeout_while(queue, remaining, |q| {
                    q.is_empty() && !shared.stop.load(Ordering::Acquire)
                })
                .unwrap();
            queue = guard;
        }
        if shared.stop.load(Ordering::Acquire) {
            // Resolve anything already buffered so its waiters wake.
            for chunk in text_buffer.iter().chain(image_buffer.iter()) {
                chunk.set_status(ChunkStatus::Failed);
            }
            shared.finish_cv.notify_all();
            break;
        }

        // Drain one chunk per wakeup; the loop re-wakes immediately while
        // the queue is non-empty.
        if let Some(queued) = queue.pop() {
            let chunk = queued.chunk;
            match &chunk.payload {
                ChunkPayload::Text(tokens) => {
                    if text_buffer.is_empty() {
                        last_text = Instant::now();
                    }
                    text_tokens += tokens.len();
                    text_buffer.push(chunk);
                }
                ChunkPayload::Image(image) => {
                    if image_buffer.is_empty() {
                        last_image = Instant::now();
                    }
                    image_tokens += image.n_tokens as usize;
                    image_buffer.push(chunk);
                }
            }
        }

        // Flush decisions run with the queue lock held; finish_cv waiters
        // share this mutex, so status transitions cannot slip between a
        // waiter's check and its sleep.
        let flush_text = !text_buffer.is_empty()
            && (last_text.elapsed() >= shared.time_wait || text_tokens >= TEXT_BATCH_SIZE);
        if flush_text {
            flush_text_batch(&shared, &llm, &text_buffer);
            text_buffer.clear();
            text_tokens = 0;
            last_text = Instant::now();
        }

        let flush_image = !image_buffer.is_empty()
            && (last_image.elapsed() >= shared.time_wait || image_tokens >= IMAGE_BATCH_SIZE);
        if flush_image {
            flush_image_batch(&shared, &llm, &image_buffer);
            image_buffer.clear();
            image_tokens = 0;
            last_image = Instant::now();
        }
    }
}

/// Pack buffered text chunks into fixed-capacity batches and submit them.
///
/// Chunks larger than one batch are split across consecutive batches. The
/// logits flag is raised on the position holding the final token of an
/// `is_last_chunk` chunk, the only position anything is sampled from.
fn flush_text_batch(
    shared: &SchedulerShared,
    llm: &LlmScheduler,
    buffer: &[Arc<ChunkTask>],
) {
    let n_batch = shared.context.n_batch;
    let mut batch = TokenBatch::new(n_batch);
    let mut first_unflushed = 0usize;

    for (i, chunk) in buffer.iter().enumerate() {
        let ChunkPayload::Text(tokens) = &chunk.payload else {
            continue;
        };
        let state = shared.context.seq_state(chunk.seq_id);

        let mut consumed = 0usize;
        while consumed < tokens.len() {
            while consumed < tokens.len() && !batch.is_full() {
                let pos = state.n_past.fetch_add(1, Ordering::AcqRel);
                batch.push(tokens[consumed], pos as i32, chunk.seq_id, false);
                consumed += 1;
            }
            if consumed == tokens.len() && chunk.is_last_chunk {
                batch.mark_last_logits();
            }
            if batch.is_full() {
                llm.submit_token_infer(std::mem::replace(&mut batch, TokenBatch::new(n_batch)));
                // Everything fully packed so far is now in flight.
                let last_done = if consumed == tokens.len() { Some(i) } else { i.checked_sub(1) };
                if let Some(last_done) = last_done {
                    for task in &buffer[first_unflushed..=last_done] {
                        task.set_status(ChunkStatus::InProgress);
                    }
                    first_unflushed = last_done + 1;
                }
            }
        }
    }

    if !batch.is_empty() {
        llm.submit_token_infer(batch);
        for task in &buffer[first_unflushed..] {
            task.set_status(ChunkStatus::InProgress);
        }
    }
    shared.finish_cv.notify_all();
}

/// Submit buffered image chunks one at a time (no batching).
fn flush_image_batch(
    shared: &SchedulerShared,
    llm: &LlmScheduler,
    buffer: &[Arc<ChunkTask>],
) {
    for chunk in buffer {
        match chunk.take_embedding() {
            Some(embedding) => {
                llm.submit_embedding_infer(chunk, embedding, chunk.seq_id);
                chunk.set_status(ChunkStatus::InProgress);
            }
            None => {
                // blocking_infer sets the embedding before enqueueing.
                warn!(seq_id = chunk.seq_id, "image chunk flushed without embedding");
                chunk.set_status(ChunkStatus::Failed);
            }
        }
    }
    shared.finish_cv.notify_all();
}
