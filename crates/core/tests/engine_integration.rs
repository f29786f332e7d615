//! End-to-end scenarios over the full pipeline: batcher, encoder, memory
//! worker, chunk KV cache, and the engine request surface, all running on
//! the deterministic mock runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mmserve_core::chunk::ChunkPayload;
use mmserve_core::config::EngineConfig;
use mmserve_core::request::{GenerateRequest, InferRequest};
use mmserve_core::runtime::ImageData;
use mmserve_core::testing::MockRuntime;
use mmserve_core::{Engine, EngineError};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn engine_with(total_seqs: u32, cache_seqs: u32, time_wait_ms: u64) -> (Arc<MockRuntime>, Engine) {
    let runtime = Arc::new(MockRuntime::new(total_seqs));
    let config = EngineConfig {
        model_path: "/models/mock.gguf".to_string(),
        chunk_size: 512,
        n_seq_max: total_seqs,
        cache_seq_num: cache_seqs,
        batch_time_wait_ms: time_wait_ms,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config, Arc::clone(&runtime) as _).expect("engine init");
    (runtime, engine)
}

fn text(tokens: &[i32]) -> ChunkPayload {
    ChunkPayload::Text(tokens.to_vec())
}

fn image(id: &str, n_tokens: u32) -> ChunkPayload {
    ChunkPayload::Image(ImageData {
        image_id: id.to_string(),
        n_tokens,
        bitmap: Arc::new(vec![0u8; 16]),
    })
}

fn prompt(engine: &Engine, cmpl_id: u64, chunks: Vec<ChunkPayload>) -> Result<String, EngineError> {
    engine
        .prompt(InferRequest {
            cmpl_id,
            priority: 0,
            chunks,
        })
        .map(|out| out.content)
}

fn stop(engine: &Engine, cmpl_id: u64) {
    engine
        .generate(GenerateRequest {
            cmpl_id,
            stop: true,
        })
        .expect("stop round");
}

// ─── Prefix cache scenarios ──────────────────────────────────────────────────

#[test]
fn identical_text_prompts_share_prefix_kv() {
    let (runtime, engine) = engine_with(5, 2, 10);

    // 600 tokens split at the 512-token chunk size: [512, 88].
    let long: Vec<i32> = (1..=600).collect();
    let chunks = || vec![text(&long[..512]), text(&long[512..])];

    let first = prompt(&engine, 1, chunks()).expect("first run");
    assert_eq!(runtime.decode_calls(), 2, "both chunks decoded cold");
    stop(&engine, 1);

    let second = prompt(&engine, 2, chunks()).expect("second run");
    stop(&engine, 2);

    // Chunk 0 was served from the cache: one extra decode, not two.
    assert_eq!(runtime.decode_calls(), 3);
    assert_eq!(first, second, "token streams must be identical");
}

#[test]
fn multimodal_prefix_reused_across_requests() {
    let (runtime, engine) = engine_with(5, 2, 10);

    let t0 = || text(&[1, 2, 3, 4]);
    let i0 = || image("img-shared", 8);

    let first = prompt(&engine, 1, vec![t0(), i0(), text(&[7, 8])]).expect("first run");
    stop(&engine, 1);
    assert_eq!(runtime.encode_calls(), 1);
    assert_eq!(runtime.image_decode_calls(), 1);
    assert_eq!(runtime.decode_calls(), 2); // T0 + T1

    // Same text+image prefix, different final text: only the final chunk
    // decodes, the image is neither re-encoded nor re-decoded.
    let second = prompt(&engine, 2, vec![t0(), i0(), text(&[9])]).expect("second run");
    stop(&engine, 2);
    assert_eq!(runtime.encode_calls(), 1);
    assert_eq!(runtime.image_decode_calls(), 1);
    assert_eq!(runtime.decode_calls(), 3);

    // Different suffixes sample from different positions/tokens.
    assert_ne!(first, second);
}

#[test]
fn concurrent_duplicate_requests_build_each_hash_once() {
    let (runtime, engine) = engine_with(6, 2, 10);
    let engine = Arc::new(engine);

    let chunks = || vec![text(&[1, 2, 3]), image("img-dup", 8), text(&[4, 5])];

    let mut handles = Vec::new();
    for cmpl_id in 1..=3u64 {
        let engine = Arc::clone(&engine);
        let chunks = chunks();
        handles.push(std::thread::spawn(move || {
            let out = prompt(&engine, cmpl_id, chunks).expect("concurrent run");
            stop(&engine, cmpl_id);
            out
        }));
    }
    let outputs: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(runtime.encode_calls(), 1, "image encoded exactly once");
    assert_eq!(runtime.image_decode_calls(), 1, "one builder per image hash");
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

#[test]
fn lru_slot_eviction_forgets_oldest_prefix() {
    // Two cache slots, three distinct prompts: the third store evicts the
    // least-recently-accessed slot.
    let (runtime, engine) = engine_with(4, 2, 10);

    for (cmpl_id, base) in [(1u64, 100), (2, 200), (3, 300)] {
        let tokens: Vec<i32> = (base..base + 4).collect();
        prompt(&engine, cmpl_id, vec![text(&tokens), text(&[9])]).expect("run");
        stop(&engine, cmpl_id);
        std::thread::sleep(Duration::from_millis(2));
    }
    let cache = engine.scheduler().chunk_cache().expect("cache enabled");
    assert_eq!(cache.occupied_slots(), 2);

    // Re-running the first prompt misses: its slot was evicted.
    let before = runtime.decode_calls();
    let tokens: Vec<i32> = (100..104).collect();
    prompt(&engine, 4, vec![text(&tokens), text(&[9])]).expect("rerun");
    stop(&engine, 4);
    assert_eq!(runtime.decode_calls(), before + 2, "both chunks re-decoded");
}

// ─── Failure handling ────────────────────────────────────────────────────────

#[test]
fn decode_failure_frees_slot_and_wait_set() {
    let (runtime, engine) = engine_with(5, 2, 10);
    runtime.fail_decode_on_call(1);

    let err = prompt(&engine, 1, vec![text(&[1, 2, 3]), text(&[4])]);
    assert!(matches!(err, Err(EngineError::InferFailed(1))));

    // The failed build released its claim and the slot went back to the
    // pool with its KV cleared.
    let cache = engine.scheduler().chunk_cache().expect("cache enabled");
    assert_eq!(cache.stored_hashes(), 0);
    assert_eq!(engine.context().active_count(), 0);

    // An unrelated request runs normally afterwards, and the previously
    // failed prefix can be rebuilt from scratch.
    prompt(&engine, 2, vec![text(&[7, 8]), text(&[9])]).expect("unrelated request");
    stop(&engine, 2);
    let rebuilt = prompt(&engine, 3, vec![text(&[1, 2, 3]), text(&[4])]).expect("rebuild");
    stop(&engine, 3);
    assert!(!rebuilt.is_empty());
    assert_eq!(cache.stored_hashes(), 2);
}

#[test]
fn encode_failure_fails_request_without_poisoning_cache() {
    let (runtime, engine) = engine_with(5, 2, 10);
    runtime.fail_encodes(true);

    let err = prompt(&engine, 1, vec![text(&[1]), image("img-bad", 4), text(&[2])]);
    assert!(matches!(err, Err(EngineError::InferFailed(1))));
    assert_eq!(engine.context().active_count(), 0);

    // The image is absent (not stuck in-flight): a retry re-encodes.
    runtime.fail_encodes(false);
    prompt(&engine, 2, vec![text(&[1]), image("img-bad", 4), text(&[2])]).expect("retry");
    stop(&engine, 2);
    assert_eq!(runtime.encode_calls(), 2);
}

// ─── Admission and session lifecycle ─────────────────────────────────────────

#[test]
fn admission_bounded_by_active_slots() {
    let (_runtime, engine) = engine_with(2, 1, 10);

    // active_max == 1: the first session occupies the only slot.
    prompt(&engine, 1, vec![text(&[1, 2])]).expect("first session");
    let second = prompt(&engine, 2, vec![text(&[3, 4])]);
    assert!(matches!(second, Err(EngineError::TooManyRequests)));

    stop(&engine, 1);
    prompt(&engine, 2, vec![text(&[3, 4])]).expect("slot freed by stop");
}

#[test]
fn duplicate_cmpl_id_rejected_while_running() {
    let (_runtime, engine) = engine_with(4, 1, 10);
    prompt(&engine, 7, vec![text(&[1])]).expect("first round");
    let dup = prompt(&engine, 7, vec![text(&[2])]);
    assert!(matches!(dup, Err(EngineError::AlreadyInfering(7))));
    stop(&engine, 7);
}

#[test]
fn generate_rounds_extend_the_sequence() {
    let (runtime, engine) = engine_with(4, 1, 10);

    let first = prompt(&engine, 1, vec![text(&[10, 11, 12])]).expect("prompt");
    assert!(!first.is_empty());

    // Each generate decodes exactly the previous token at the next
    // position, so the stream is fully determined by the prompt.
    let expected_1 = MockRuntime::expected_sample(12, 2);
    assert_eq!(first, format!("<tok{expected_1}>"));

    let second = engine
        .generate(GenerateRequest {
            cmpl_id: 1,
            stop: false,
        })
        .expect("generate");
    let expected_2 = MockRuntime::expected_sample(expected_1, 3);
    assert_eq!(second.content, format!("<tok{expected_2}>"));
    assert!(!second.is_finished);

    stop(&engine, 1);
    assert_eq!(engine.context().active_count(), 0);
    // Shutdown flushes the memory worker, so the queued KV clear from the
    // stop round has run by the time we look.
    engine.shutdown();
    assert!(runtime.kv_tokens(0).is_empty());
}

#[test]
fn generate_without_prompt_is_rejected() {
    let (_runtime, engine) = engine_with(4, 1, 10);
    let out = engine.generate(GenerateRequest {
        cmpl_id: 42,
        stop: false,
    });
    assert!(matches!(out, Err(EngineError::NotInfering(42))));
}

#[test]
fn end_of_generation_token_finishes_session() {
    let (runtime, engine) = engine_with(4, 1, 10);
    runtime.set_eog_token(MockRuntime::expected_sample(7, 2));

    let out = engine
        .prompt(InferRequest {
            cmpl_id: 1,
            priority: 0,
            chunks: vec![text(&[5, 6, 7])],
        })
        .expect("prompt");
    assert!(out.is_finished);
    assert!(out.content.is_empty());
    assert_eq!(engine.context().active_count(), 0);
}

// ─── Batching policy ─────────────────────────────────────────────────────────

#[test]
fn small_chunk_flushes_after_time_wait() {
    let (runtime, engine) = engine_with(4, 0, 50);

    let started = Instant::now();
    prompt(&engine, 1, vec![text(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])]).expect("prompt");
    let elapsed = started.elapsed();
    stop(&engine, 1);

    assert_eq!(runtime.decode_calls(), 1);
    assert!(
        elapsed >= Duration::from_millis(50),
        "10 tokens must wait out the batching window, got {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(2), "flush latency is bounded");
}

#[test]
fn full_size_chunk_flushes_immediately() {
    let (runtime, engine) = engine_with(4, 0, 5000);

    // 512 tokens hit the text size threshold: no 5-second wait.
    let tokens: Vec<i32> = (1..=512).collect();
    let started = Instant::now();
    prompt(&engine, 1, vec![text(&tokens)]).expect("prompt");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(runtime.decode_calls(), 1);
    stop(&engine, 1);
}

#[test]
fn cold_rerun_after_engine_restart_is_deterministic() {
    let chunks = || vec![text(&[3, 1, 4, 1, 5]), text(&[9, 2, 6])];

    let (_r1, engine1) = engine_with(5, 2, 10);
    let first = prompt(&engine1, 1, chunks()).expect("run on engine 1");
    drop(engine1);

    let (_r2, engine2) = engine_with(5, 2, 10);
    let second = prompt(&engine2, 1, chunks()).expect("run on engine 2");

    assert_eq!(first, second);
}
