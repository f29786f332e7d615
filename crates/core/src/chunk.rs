//! Request chunks and prefix-cumulative content hashing.
//!
//! A request is an ordered list of chunks: runs of text tokens and single
//! images. Each chunk position gets a hash that fingerprints the *entire
//! prefix* up to and including it, so two requests whose chunk lists agree
//! up to position `k` share `hashes[0..=k]`. The KV prefix cache is keyed
//! by these hashes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::{ImageData, SeqId, Token};

/// Lifecycle of a chunk inside the batching pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkStatus {
    /// Created, not yet enqueued.
    Wait = 0,
    /// Enqueued, waiting for the batching loop to pick it up.
    Pending = 1,
    /// Part of a submitted decode batch.
    InProgress = 2,
    Completed = 3,
    Failed = 4,
}

impl ChunkStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Wait,
            1 => Self::Pending,
            2 => Self::InProgress,
            3 => Self::Completed,
            _ => Self::Failed,
        }
    }

    /// True while the chunk has not yet been handed to the LLM scheduler.
    pub fn is_unflushed(self) -> bool {
        matches!(self, Self::Wait | Self::Pending)
    }
}

/// The payload of one chunk: a run of text tokens or a single image.
#[derive(Debug, Clone)]
pub enum ChunkPayload {
    Text(Vec<Token>),
    Image(ImageData),
}

impl ChunkPayload {
    /// Number of KV positions this chunk consumes.
    pub fn n_tokens(&self) -> usize {
        match self {
            Self::Text(tokens) => tokens.len(),
            Self::Image(image) => image.n_tokens as usize,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image(_))
    }

    pub fn as_image(&self) -> Option<&ImageData> {
        match self {
            Self::Image(image) => Some(image),
            Self::Text(_) => None,
        }
    }
}

/// One schedulable unit of work, shared between the request thread and the
/// batching loop. Status and embedding are written by the workers and read
/// by the request thread under the task-queue lock's condition variables.
#[derive(Debug)]
pub struct ChunkTask {
    pub payload: ChunkPayload,
    /// Active sequence slot doing the work for this request.
    pub seq_id: SeqId,
    /// Lower value = served first; ties pop in submission order.
    pub priority: i32,
    pub is_last_chunk: bool,
    status: AtomicU8,
    embedding: Mutex<Option<Arc<Vec<f32>>>>,
}

impl ChunkTask {
    pub fn new(payload: ChunkPayload, seq_id: SeqId, priority: i32, is_last_chunk: bool) -> Self {
        Self {
            payload,
            seq_id,
            priority,
            is_last_chunk,
            status: AtomicU8::new(ChunkStatus::Wait as u8),
            embedding: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ChunkStatus {
        ChunkStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ChunkStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn set_embedding(&self, embedding: Arc<Vec<f32>>) {
        *self.embedding.lock().unwrap() = Some(embedding);
    }

    pub fn take_embedding(&self) -> Option<Arc<Vec<f32>>> {
        self.embedding.lock().unwrap().take()
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a_extend(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Descriptor of a single chunk as fed to the hash: text chunks contribute
/// their comma-joined token ids, image chunks `IMG:<image_id>,`.
fn chunk_descriptor(payload: &ChunkPayload) -> String {
    match payload {
        ChunkPayload::Text(tokens) => {
            let mut s = String::with_capacity(tokens.len() * 6);
            for t in tokens {
                s.push_str(&t.to_string());
                s.push(',');
            }
            s
        }
        ChunkPayload::Image(image) => format!("IMG:{},", image.image_id),
    }
}

/// Prefix-cumulative FNV-1a-64 hashes: `hashes[i]` covers the descriptor
/// stream of chunks `0..=i`. FNV-1a consumes bytes left to right, so the
/// hash at position `i` extends the hash at `i - 1`.
pub fn prefix_hashes<'a, I>(payloads: I) -> Vec<u64>
where
    I: IntoIterator<Item = &'a ChunkPayload>,
{
    let mut hashes = Vec::new();
    let mut hash = FNV_OFFSET_BASIS;
    for payload in payloads {
        hash = fnv1a_extend(hash, chunk_descriptor(payload).as_bytes());
        hashes.push(hash);
    }
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(tokens: &[Token]) -> ChunkPayload {
        ChunkPayload::Text(tokens.to_vec())
    }

    fn image(id: &str, n_tokens: u32) -> ChunkPayload {
        ChunkPayload::Image(ImageData {
            image_id: id.to_string(),
            n_tokens,
            bitmap: Arc::new(Vec::new()),
        })
    }

    #[test]
    fn hashes_are_deterministic() {
        let chunks = vec![text(&[1, 2, 3]), image("img-a", 16), text(&[4])];
        let h1 = prefix_hashes(&chunks);
        let h2 = prefix_hashes(&chunks);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 3);
    }

    #[test]
    fn shared_prefix_shares_hashes() {
        let a = vec![text(&[1, 2, 3]), image("img-a", 16), text(&[4])];
        let b = vec![text(&[1, 2, 3]), image("img-a", 16), text(&[9, 9])];
        let ha = prefix_hashes(&a);
        let hb = prefix_hashes(&b);
        assert_eq!(ha[0], hb[0]);
        assert_eq!(ha[1], hb[1]);
        assert_ne!(ha[2], hb[2]);
    }

    #[test]
    fn diverging_first_chunk_diverges_everywhere() {
        let a = vec![text(&[1, 2]), text(&[3, 4])];
        let b = vec![text(&[9, 2]), text(&[3, 4])];
        let ha = prefix_hashes(&a);
        let hb = prefix_hashes(&b);
        assert_ne!(ha[0], hb[0]);
        assert_ne!(ha[1], hb[1]);
    }

    #[test]
    fn token_boundaries_matter() {
        // [12] vs [1, 2]: the comma separator keeps descriptors distinct.
        let a = prefix_hashes(&[text(&[12])]);
        let b = prefix_hashes(&[text(&[1, 2])]);
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn image_hash_uses_id_not_bitmap() {
        let a = ChunkPayload::Image(ImageData {
            image_id: "same".into(),
            n_tokens: 8,
            bitmap: Arc::new(vec![1, 2, 3]),
        });
        let b = ChunkPayload::Image(ImageData {
            image_id: "same".into(),
            n_tokens: 8,
            bitmap: Arc::new(vec![4, 5, 6]),
        });
        assert_eq!(prefix_hashes([&a])[0], prefix_hashes([&b])[0]);
    }

    #[test]
    fn status_roundtrip() {
        let task = ChunkTask::new(text(&[1]), 0, 0, false);
        assert_eq!(task.status(), ChunkStatus::Wait);
        assert!(task.status().is_unflushed());
        task.set_status(ChunkStatus::InProgress);
        assert_eq!(task.status(), ChunkStatus::InProgress);
        assert!(!task.status().is_unflushed());
    }

    #[test]
    fn embedding_take_clears_slot() {
        let task = ChunkTask::new(image("i", 4), 0, 0, false);
        task.set_embedding(Arc::new(vec![0.5; 4]));
        assert!(task.take_embedding().is_some());
        assert!(task.take_embedding().is_none());
    }
}
