//! Single-worker serialization point for KV memory.
//!
//! The runtime's KV mutators are not re-entrant with decode, so every
//! mutating memory operation, and every decode job (see [`crate::llm`]),
//! funnels through this one worker thread. Submission order is execution
//! order, which gives the whole engine a total order over KV state
//! transitions.
//!
//! Submissions are fire-and-forget: a panicking task is logged and
//! dropped, and the worker moves on. Callers that need completion wait on
//! their own condition variables downstream.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, error};

use crate::runtime::{ModelRuntime, SeqId};

type MemoryJob = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    jobs: VecDeque<MemoryJob>,
    /// True while the worker is inside a job; `flush` waits for both an
    /// empty queue and an idle worker.
    in_flight: bool,
    stopped: bool,
}

struct MemoryInner {
    queue: Mutex<QueueState>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

pub struct MemoryScheduler {
    runtime: Arc<dyn ModelRuntime>,
    inner: Arc<MemoryInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MemoryScheduler {
    pub fn new(runtime: Arc<dyn ModelRuntime>) -> Self {
        let inner = Arc::new(MemoryInner {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                in_flight: false,
                stopped: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("kv-memory".to_string())
            .spawn(move || worker_loop(worker_inner))
            .expect("failed to spawn kv-memory worker");

        Self {
            runtime,
            inner,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Remove KV positions `[p0, p1)` from `seq_id`; `-1` means "all".
    pub fn clear(&self, seq_id: SeqId, p0: i32, p1: i32) {
        let runtime = Arc::clone(&self.runtime);
        self.submit(move || runtime.kv_remove(seq_id, p0, p1));
    }

    /// Copy KV positions from `src` into `dst`, skipping positions `dst`
    /// already holds: the start is clamped to `max(p0, kv_max_pos(dst)+1)`
    /// and the copy is skipped when the clamped range is empty.
    pub fn copy(&self, src: SeqId, dst: SeqId, p0: i32, p1: i32) {
        let runtime = Arc::clone(&self.runtime);
        self.submit(move || {
            let clamped = p0.max(runtime.kv_max_pos(dst) + 1);
            if clamped < p1 || p1 == -1 {
                runtime.kv_copy(src, dst, clamped, p1);
            } else {
                debug!(src, dst, p0, p1, clamped, "kv copy skipped: empty range");
            }
        });
    }

    /// Run an arbitrary closure on the worker, after everything already
    /// queued. Fire-and-forget.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.stopped {
                debug!("memory scheduler stopped, dropping job");
                return;
            }
            queue.jobs.push_back(Box::new(job));
        }
        self.inner.work_cv.notify_one();
    }

    /// Block until the queue is drained and the worker is idle.
    pub fn flush(&self) {
        let queue = self.inner.queue.lock().unwrap();
        let _guard = self
            .inner
            .idle_cv
            .wait_while(queue, |q| !q.jobs.is_empty() || q.in_flight)
            .unwrap();
    }

    /// Stop the worker at its next idle point; queued jobs are dropped
    /// unless the caller flushed first. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.stopped = true;
        }
        self.inner.work_cv.notify_one();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MemoryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<MemoryInner>) {
    loop {
        let job = {
            let queue = inner.queue.lock().unwrap();
            let mut queue = inner
                .work_cv
                .wait_while(queue, |q| q.jobs.is_empty() && !q.stopped)
                .unwrap();
            if queue.stopped {
                break;
            }
            let job = queue.jobs.pop_front();
            if job.is_some() {
                queue.in_flight = true;
            }
            job
        };

        let Some(job) = job else { continue };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("memory task panicked, dropping it");
        }

        let mut queue = inner.queue.lock().unwrap();
        queue.in_flight = false;
        if queue.jobs.is_empty() {
            inner.idle_cv.notify_all();
        }
    }
}
