use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::runtime::{ImageData, ModelRuntime, RuntimeError, SeqId, Token, TokenBatch};

/// Instrumented in-memory model runtime.
///
/// KV is a position → token map per sequence, so tests can check exactly
/// which positions a copy or clear touched. Sampling is a pure function
/// of the decoded batch row (`1000 + (token*7 + pos*13) % 9000`), which
/// makes token streams reproducible across runs with identical inputs.
pub struct MockRuntime {
    max_sequences: SeqId,
    kv: Mutex<HashMap<SeqId, BTreeMap<i32, Token>>>,
    copies: Mutex<Vec<(SeqId, SeqId, i32, i32)>>,
    cleared: Mutex<HashSet<SeqId>>,
    last_batch: Mutex<Option<TokenBatch>>,
    accepted: Mutex<Vec<Token>>,
    decode_calls: AtomicUsize,
    decode_times: Mutex<Vec<Instant>>,
    image_decode_calls: AtomicUsize,
    encode_calls: AtomicUsize,
    fail_encodes: AtomicBool,
    fail_image_decodes: AtomicBool,
    /// 1-based call number that should fail; 0 = never.
    fail_decode_call: AtomicUsize,
    eog_token: Mutex<Option<Token>>,
}

impl MockRuntime {
    /// Embedding width per image token.
    pub const EMBED_DIM: usize = 8;

    pub fn new(max_sequences: SeqId) -> Self {
        Self {
            max_sequences,
            kv: Mutex::new(HashMap::new()),
            copies: Mutex::new(Vec::new()),
            cleared: Mutex::new(HashSet::new()),
            last_batch: Mutex::new(None),
            accepted: Mutex::new(Vec::new()),
            decode_calls: AtomicUsize::new(0),
            decode_times: Mutex::new(Vec::new()),
            image_decode_calls: AtomicUsize::new(0),
            encode_calls: AtomicUsize::new(0),
            fail_encodes: AtomicBool::new(false),
            fail_image_decodes: AtomicBool::new(false),
            fail_decode_call: AtomicUsize::new(0),
            eog_token: Mutex::new(None),
        }
    }

    // ── instrumentation ──────────────────────────────────────────────────

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn decode_call_times(&self) -> Vec<Instant> {
        self.decode_times.lock().unwrap().clone()
    }

    pub fn image_decode_calls(&self) -> usize {
        self.image_decode_calls.load(Ordering::SeqCst)
    }

    pub fn encode_calls(&self) -> usize {
        self.encode_calls.load(Ordering::SeqCst)
    }

    pub fn accepted_tokens(&self) -> Vec<Token> {
        self.accepted.lock().unwrap().clone()
    }

    /// Copies executed with `dst` as the destination, in execution order.
    pub fn kv_copied_ranges(&self, dst: SeqId) -> Vec<(SeqId, SeqId, i32, i32)> {
        self.copies
            .lock()
            .unwrap()
            .iter()
            .filter(|&&(_, d, _, _)| d == dst)
            .copied()
            .collect()
    }

    /// Whether a whole-sequence clear ran for `seq_id`.
    pub fn kv_cleared(&self, seq_id: SeqId) -> bool {
        self.cleared.lock().unwrap().contains(&seq_id)
    }

    /// Tokens currently resident in `seq_id`'s KV, in position order.
    pub fn kv_tokens(&self, seq_id: SeqId) -> Vec<Token> {
        self.kv
            .lock()
            .unwrap()
            .get(&seq_id)
            .map(|m| m.values().copied().collect())
            .unwrap_or_default()
    }

    // ── scripting ────────────────────────────────────────────────────────

    /// Pre-populate `seq_id`'s KV with `tokens` at positions `0..len`.
    pub fn seed_kv(&self, seq_id: SeqId, tokens: &[Token]) {
        let mut kv = self.kv.lock().unwrap();
        let seq = kv.entry(seq_id).or_default();
        for (pos, &token) in tokens.iter().enumerate() {
            seq.insert(pos as i32, token);
        }
    }

    pub fn fail_encodes(&self, fail: bool) {
        self.fail_encodes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_image_decodes(&self, fail: bool) {
        self.fail_image_decodes.store(fail, Ordering::SeqCst);
    }

    /// Make the `n`-th `decode_tokens` call fail (1-based).
    pub fn fail_decode_on_call(&self, n: usize) {
        self.fail_decode_call.store(n, Ordering::SeqCst);
    }

    /// Token treated as the end-of-generation marker.
    pub fn set_eog_token(&self, token: Token) {
        *self.eog_token.lock().unwrap() = Some(token);
    }

    /// The token `sample` will produce for a `(token, pos)` batch row.
    pub fn expected_sample(token: Token, pos: i32) -> Token {
        1000 + (token * 7 + pos * 13).rem_euclid(9000)
    }
}

impl ModelRuntime for MockRuntime {
    fn max_sequences(&self) -> SeqId {
        self.max_sequences
    }

    fn decode_tokens(&self, batch: &TokenBatch) -> Result<(), RuntimeError> {
        let call = self.decode_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.decode_times.lock().unwrap().push(Instant::now());
        if self.fail_decode_call.load(Ordering::SeqCst) == call {
            return Err(RuntimeError::Decode(format!("scripted failure on call {call}")));
        }

        let mut kv = self.kv.lock().unwrap();
        for i in 0..batch.len() {
            kv.entry(batch.seq_id(i))
                .or_default()
                .insert(batch.pos(i), batch.token(i));
        }
        *self.last_batch.lock().unwrap() = Some(batch.clone());
        Ok(())
    }

    fn encode_image(&self, image: &ImageData) -> Result<Vec<f32>, RuntimeError> {
        self.encode_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_encodes.load(Ordering::SeqCst) {
            return Err(RuntimeError::Encode(format!(
                "scripted encode failure for {}",
                image.image_id
            )));
        }
        Ok(vec![0.5; image.n_tokens as usize * Self::EMBED_DIM])
    }

    fn decode_image(
        &self,
        image: &ImageData,
        embedding: &[f32],
        pos: u32,
        seq_id: SeqId,
        _n_batch: usize,
    ) -> Result<u32, RuntimeError> {
        self.image_decode_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_image_decodes.load(Ordering::SeqCst) {
            return Err(RuntimeError::Decode(format!(
                "scripted image decode failure for {}",
                image.image_id
            )));
        }
        debug_assert_eq!(embedding.len(), image.n_tokens as usize * Self::EMBED_DIM);

        let mut kv = self.kv.lock().unwrap();
        let seq = kv.entry(seq_id).or_default();
        for offset in 0..image.n_tokens {
            // Image positions hold no real token id.
            seq.insert((pos + offset) as i32, 0);
        }
        Ok(pos + image.n_tokens)
    }

    fn kv_remove(&self, seq_id: SeqId, p0: i32, p1: i32) {
        if p0 <= 0 && p1 == -1 {
            self.cleared.lock().unwrap().insert(seq_id);
        }
        let mut kv = self.kv.lock().unwrap();
        if let Some(seq) = kv.get_mut(&seq_id) {
            let start = p0.max(0);
            seq.retain(|&pos, _| pos < start || (p1 != -1 && pos >= p1));
        }
    }

    fn kv_copy(&self, src: SeqId, dst: SeqId, p0: i32, p1: i32) {
        self.copies.lock().unwrap().push((src, dst, p0, p1));
        let mut kv = self.kv.lock().unwrap();
        let rows: Vec<(i32, Token)> = kv
            .get(&src)
            .map(|seq| {
                seq.iter()
                    .filter(|&(&pos, _)| pos >= p0.max(0) && (p1 == -1 || pos < p1))
                    .map(|(&pos, &token)| (pos, token))
                    .collect()
            })
            .unwrap_or_default();
        let dst_seq = kv.entry(dst).or_default();
        for (pos, token) in rows {
            dst_seq.insert(pos, token);
        }
    }

    fn kv_max_pos(&self, seq_id: SeqId) -> i32 {
        self.kv
            .lock()
            .unwrap()
            .get(&seq_id)
            .and_then(|seq| seq.keys().next_back().copied())
            .unwrap_or(-1)
    }

    fn sample(&self, pos: usize) -> Token {
        let batch = self.last_batch.lock().unwrap();
        let batch = batch.as_ref().expect("sample called before decode");
        Self::expected_sample(batch.token(pos), batch.pos(pos))
    }

    fn accept(&self, token: Token) {
        self.accepted.lock().unwrap().push(token);
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.eog_token.lock().unwrap().map_or(false, |eog| eog == token)
    }

    fn detokenize(&self, token: Token) -> String {
        format!("<tok{token}>")
    }
}
