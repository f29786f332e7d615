//! The seam between the serving core and the model runtime.
//!
//! Everything the core needs from the underlying model (batched token
//! decode, image encoding, per-sequence KV memory operations, sampling and
//! detokenization) goes through [`ModelRuntime`]. The core never touches
//! tensors; it moves token ids, positions and embedding vectors.
//!
//! Implementations must be callable from multiple threads: the memory
//! worker issues decode and KV calls, the encoder worker issues
//! `encode_image`, and request threads call `detokenize` /
//! `is_end_of_generation` concurrently.

use std::sync::Arc;

use thiserror::Error;

/// A token id. Negative values are sentinels inside the core:
/// `-1` marks a failed decode, `0` "no token produced at this step".
pub type Token = i32;

/// A sequence id: one KV lane in the runtime, `0..max_sequences()`.
pub type SeqId = u32;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("image encode failed: {0}")]
    Encode(String),
}

/// Decoded image input: a stable content id, the number of positions the
/// image occupies in the sequence, and the (opaque) bitmap bytes.
#[derive(Debug, Clone)]
pub struct ImageData {
    /// Content-derived identifier; equal bytes produce equal ids.
    pub image_id: String,
    /// Number of KV positions this image consumes when decoded.
    pub n_tokens: u32,
    /// Raw bitmap, shared with the request that carried it.
    pub bitmap: Arc<Vec<u8>>,
}

/// A packed decode batch: parallel arrays of token id, position, sequence
/// id and the logits flag, bounded by a fixed capacity (`n_batch`).
#[derive(Debug, Clone)]
pub struct TokenBatch {
    tokens: Vec<Token>,
    positions: Vec<i32>,
    seq_ids: Vec<SeqId>,
    logits: Vec<bool>,
    capacity: usize,
}

impl TokenBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
            seq_ids: Vec::with_capacity(capacity),
            logits: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append one token. Panics if the batch is already full; callers check
    /// [`is_full`](Self::is_full) while packing.
    pub fn push(&mut self, token: Token, pos: i32, seq_id: SeqId, logits: bool) {
        assert!(self.tokens.len() < self.capacity, "token batch overflow");
        self.tokens.push(token);
        self.positions.push(pos);
        self.seq_ids.push(seq_id);
        self.logits.push(logits);
    }

    /// Set the logits flag on the last position. No-op on an empty batch.
    pub fn mark_last_logits(&mut self) {
        if let Some(flag) = self.logits.last_mut() {
            *flag = true;
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tokens.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn token(&self, i: usize) -> Token {
        self.tokens[i]
    }

    pub fn pos(&self, i: usize) -> i32 {
        self.positions[i]
    }

    pub fn seq_id(&self, i: usize) -> SeqId {
        self.seq_ids[i]
    }

    pub fn wants_logits(&self, i: usize) -> bool {
        self.logits[i]
    }
}

/// Contract the core consumes from the model runtime.
///
/// KV memory is keyed by sequence id; positions within a sequence are
/// `[0, n_past)`. Range arguments follow the half-open `[p0, p1)`
/// convention with `-1` meaning "unbounded" on either end.
pub trait ModelRuntime: Send + Sync {
    /// Total number of sequence ids the runtime exposes (`SEQ_MAX`).
    fn max_sequences(&self) -> SeqId;

    /// Decode a packed token batch. Positions flagged for logits keep
    /// their output rows available for [`sample`](Self::sample).
    fn decode_tokens(&self, batch: &TokenBatch) -> Result<(), RuntimeError>;

    /// Run the image encoder and return the embedding vector for `image`.
    fn encode_image(&self, image: &ImageData) -> Result<Vec<f32>, RuntimeError>;

    /// Decode an encoded image into the KV of `seq_id` starting at `pos`.
    /// Returns the new past-position on success.
    fn decode_image(
        &self,
        image: &ImageData,
        embedding: &[f32],
        pos: u32,
        seq_id: SeqId,
        n_batch: usize,
    ) -> Result<u32, RuntimeError>;

    /// Remove KV positions `[p0, p1)` from `seq_id`; `-1` means "all".
    fn kv_remove(&self, seq_id: SeqId, p0: i32, p1: i32);

    /// Copy KV positions `[p0, p1)` from `src` into `dst`.
    fn kv_copy(&self, src: SeqId, dst: SeqId, p0: i32, p1: i32);

    /// Highest position present in `seq_id`'s KV, or `-1` when empty.
    fn kv_max_pos(&self, seq_id: SeqId) -> i32;

    /// Sample a token from the logits emitted at batch position `pos`.
    fn sample(&self, pos: usize) -> Token;

    /// Feed a sampled token back into the sampler state.
    fn accept(&self, token: Token);

    fn is_end_of_generation(&self, token: Token) -> bool;

    fn detokenize(&self, token: Token) -> String;
}
