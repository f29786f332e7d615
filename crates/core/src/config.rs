//! Engine configuration, deserialized from the init JSON blob.
//!
//! The core consumes the scheduling keys (`n_seq_max`, `cache_seq_num`,
//! `chunk_size`, `context_per_seq`, batching timings). Model and sampling
//! keys are carried through for whoever constructs the model runtime, and
//! `log_file` / `log_level` for whoever installs the tracing subscriber.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the language model weights. Required.
    pub model_path: String,
    /// Path to the multimodal projector weights.
    pub mmproj_path: Option<String>,
    /// Model alias reported to clients.
    pub model: Option<String>,
    pub n_gpu_layers: i32,
    /// Total KV size across all sequences.
    pub total_context_num: u32,
    /// Logical batch size; sets both `n_batch` and `n_ubatch`.
    pub chunk_size: usize,
    /// Physical batch size override; defaults to `chunk_size`.
    pub n_ubatch: Option<usize>,
    /// Total sequence slots the runtime exposes.
    pub n_seq_max: u32,
    /// Slots reserved for the chunk KV cache; must be < `n_seq_max`.
    /// `0` disables prefix caching.
    pub cache_seq_num: u32,
    pub mmproj_use_gpu: bool,
    /// Context budget per sequence; prompts are cropped to 80% of it.
    pub context_per_seq: usize,
    /// Sampling temperature; negative selects greedy sampling.
    pub temp: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub seed: Option<u64>,
    pub log_file: Option<String>,
    pub log_level: Option<String>,
    /// How long the batching loop waits for more work before flushing a
    /// partial batch, in milliseconds.
    pub batch_time_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            mmproj_path: None,
            model: None,
            n_gpu_layers: 0,
            total_context_num: 32768,
            chunk_size: 1024,
            n_ubatch: None,
            n_seq_max: 8,
            cache_seq_num: 2,
            mmproj_use_gpu: true,
            context_per_seq: 8192,
            temp: -1.0,
            top_k: 40,
            top_p: 0.95,
            seed: None,
            log_file: None,
            log_level: None,
            batch_time_wait_ms: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The decode batch capacity (`n_batch`).
    pub fn n_batch(&self) -> usize {
        self.chunk_size
    }

    pub fn n_ubatch(&self) -> usize {
        self.n_ubatch.unwrap_or(self.chunk_size)
    }

    /// Structural validation; model-file existence is the runtime's concern.
    pub fn validate(&self) -> Result<(), String> {
        if self.model_path.is_empty() {
            return Err("model_path is not set".to_string());
        }
        if self.n_seq_max == 0 {
            return Err("n_seq_max must be > 0".to_string());
        }
        if self.cache_seq_num >= self.n_seq_max {
            return Err(format!(
                "cache_seq_num {} must be smaller than n_seq_max {}",
                self.cache_seq_num, self.n_seq_max
            ));
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be > 0".to_string());
        }
        if self.context_per_seq == 0 {
            return Err("context_per_seq must be > 0".to_string());
        }
        Ok(())
    }
}
