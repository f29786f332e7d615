//! Single-worker image encoder queue, fronted by the embedding cache.
//!
//! Image chunks are pre-submitted as soon as a request arrives so the
//! encoder overlaps with text decode of earlier chunks. The cache's wait
//! set deduplicates concurrent submissions of the same image; whichever
//! request reaches [`EncoderScheduler::wait_for_result`] first blocks on
//! the single in-flight encode.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use tracing::{debug, error};

use crate::chunk::ChunkTask;
use crate::encoder_cache::ImageEmbeddingCache;
use crate::runtime::ModelRuntime;

/// Default bounds for the embedding cache behind the encoder.
const DEFAULT_CACHE_ENTRIES: usize = 100;
const DEFAULT_CACHE_BYTES: usize = 1024 * 1024 * 1024;

struct EncoderInner {
    runtime: Arc<dyn ModelRuntime>,
    cache: Arc<ImageEmbeddingCache>,
    queue: Mutex<VecDeque<Arc<ChunkTask>>>,
    work_cv: Condvar,
    finish_cv: Condvar,
    stop: AtomicBool,
}

pub struct EncoderScheduler {
    inner: Arc<EncoderInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EncoderScheduler {
    pub fn new(runtime: Arc<dyn ModelRuntime>) -> Self {
        Self::with_cache(
            runtime,
            Arc::new(ImageEmbeddingCache::new(
                DEFAULT_CACHE_ENTRIES,
                DEFAULT_CACHE_BYTES,
            )),
        )
    }

    pub fn with_cache(runtime: Arc<dyn ModelRuntime>, cache: Arc<ImageEmbeddingCache>) -> Self {
        let inner = Arc::new(EncoderInner {
            runtime,
            cache,
            queue: Mutex::new(VecDeque::new()),
            work_cv: Condvar::new(),
            finish_cv: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("image-encoder".to_string())
            .spawn(move || worker_loop(worker_inner))
            .expect("failed to spawn image-encoder worker");

        Self {
            inner,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn cache(&self) -> &Arc<ImageEmbeddingCache> {
        &self.inner.cache
    }

    /// Queue an encode for an image chunk. No-op for text chunks and for
    /// images already in-flight or stored.
    pub fn submit_encoder_task(&self, chunk: &Arc<ChunkTask>) {
        let Some(image) = chunk.payload.as_image() else {
            return;
        };
        let mut queue = self.inner.queue.lock().unwrap();
        if self.inner.cache.prepare(image).is_none() {
            return;
        }
        queue.push_back(Arc::clone(chunk));
        drop(queue);
        self.inner.work_cv.notify_one();
    }

    /// Block until the chunk's image leaves the in-flight state, then look
    /// it up. `None` means the encode failed.
    pub fn wait_for_result(&self, chunk: &ChunkTask) -> Option<Arc<Vec<f32>>> {
        let image = chunk.payload.as_image()?;
        let queue = self.inner.queue.lock().unwrap();
        let _guard = self
            .inner
            .finish_cv
            .wait_while(queue, |_| self.inner.cache.waiting(image))
            .unwrap();
        self.inner.cache.lookup(image)
    }

    /// Submit and wait in one call.
    pub fn blocking_encoder(&self, chunk: &Arc<ChunkTask>) -> Option<Arc<Vec<f32>>> {
        self.submit_encoder_task(chunk);
        self.wait_for_result(chunk)
    }

    /// Stop the worker after its current item. Idempotent.
    pub fn shutdown(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.work_cv.notify_one();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EncoderScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<EncoderInner>) {
    loop {
        let chunk = {
            let queue = inner.queue.lock().unwrap();
            let mut queue = inner
                .work_cv
                .wait_while(queue, |q| {
                    q.is_empty() && !inner.stop.load(Ordering::Acquire)
                })
                .unwrap();
            if inner.stop.load(Ordering::Acquire) {
                break;
            }
            queue.pop_front()
        };

        let Some(chunk) = chunk else { continue };
        encode_one(&inner, &chunk);

        // Pair with the queue mutex so a waiter between its state check and
        // its sleep cannot miss the wakeup.
        let _queue = inner.queue.lock().unwrap();
        inner.finish_cv.notify_all();
    }
}

fn encode_one(inner: &EncoderInner, chunk: &ChunkTask) {
    let Some(image) = chunk.payload.as_image() else {
        return;
    };

    let started = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| inner.runtime.encode_image(image)));
    match result {
        Ok(Ok(embedding)) => {
            debug!(
                image_id = %image.image_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "image encoded"
            );
            inner.cache.store(image, embedding);
        }
        Ok(Err(err)) => {
            error!(image_id = %image.image_id, %err, "failed to encode image");
            inner.cache.cancel(image);
        }
        Err(_) => {
            error!(image_id = %image.image_id, "image encode panicked, dropping task");
            inner.cache.cancel(image);
        }
    }
}
