//! Prefix-keyed KV reuse across requests.

mod chunk_cache;

pub use chunk_cache::{CacheEntry, ChunkInferCache};
