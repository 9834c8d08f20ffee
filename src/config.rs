//! Configuration types for nano-infer.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kernels::SimdLevel;

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Request admission and batching.
    pub scheduler: SchedulerConfig,
    /// KV cache sizing and overflow behaviour.
    pub cache: CacheConfig,
    /// Kernel selection and tuning.
    pub kernels: KernelConfig,
    /// Dequantize quantized weights once at load instead of per call.
    pub dequantize_at_load: bool,
}

impl EngineConfig {
    /// Parse an engine configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load an engine configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Check that the values are mutually consistent.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_num_seqs == 0 {
            return Err(Error::Config("max_num_seqs must be at least 1".into()));
        }
        if self.scheduler.max_prefill_tokens == 0 {
            return Err(Error::Config("max_prefill_tokens must be at least 1".into()));
        }
        if self.cache.max_context == 0 {
            return Err(Error::Config("max_context must be at least 1".into()));
        }
        if self.cache.block_size == 0 {
            return Err(Error::Config("block_size must be at least 1".into()));
        }
        if self.kernels.parallel_row_threshold == 0 {
            return Err(Error::Config(
                "parallel_row_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of requests in Prefilling/Decoding at once.
    pub max_num_seqs: usize,
    /// Maximum prompt tokens admitted for prefill per tick.
    pub max_prefill_tokens: usize,
    /// Order admissions by priority before arrival.
    pub enable_priority: bool,
    /// Keep the tail of over-long prompts instead of rejecting them.
    pub truncate_long_prompts: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 16,
            max_prefill_tokens: 4096,
            enable_priority: true,
            truncate_long_prompts: false,
        }
    }
}

/// What happens when a slot is full and another position is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the append; the owning request fails with `CacheOverflow`.
    Reject,
    /// Drop the oldest position and shift the window.
    SlidingWindow,
}

/// What the scheduler does when the aggregate cache budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressurePolicy {
    /// Reserve each request's worst case at admission; keep the rest queued.
    RefuseAdmission,
    /// Fail the least-recently-extended running request to free memory.
    EvictLeastRecent,
    /// Re-queue the least-recently-extended running request for recomputation.
    PreemptLeastRecent,
}

/// KV cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Positions per slot (maximum context length).
    pub max_context: usize,
    /// Storage grows in chunks of this many positions.
    pub block_size: usize,
    /// Aggregate byte budget across all slots (`None` = unbounded).
    pub memory_budget_bytes: Option<usize>,
    /// Behaviour when a slot reaches capacity.
    pub overflow_policy: OverflowPolicy,
    /// Behaviour when the aggregate budget is exhausted.
    pub pressure_policy: PressurePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_context: 2048,
            block_size: 16,
            memory_budget_bytes: None,
            overflow_policy: OverflowPolicy::Reject,
            pressure_policy: PressurePolicy::RefuseAdmission,
        }
    }
}

/// Kernel dispatcher configuration.
///
/// Thresholds were profiled on one machine; treat them as per-deployment
/// tuning values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Row count at which matmul splits rows across worker threads.
    pub parallel_row_threshold: usize,
    /// `m * k * n` at or below which the direct scalar path is used.
    pub tiny_work_threshold: usize,
    /// Pin a specific variant instead of the widest detected one.
    pub force_level: Option<SimdLevel>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            parallel_row_threshold: 64,
            tiny_work_threshold: 512,
            force_level: None,
        }
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Token sequences that end generation when the output ends with them.
    pub stop_sequences: Vec<Vec<u32>>,
    /// Seed for the sampler's RNG (`None` = seeded from entropy).
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 256,
            stop_sequences: Vec::new(),
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding for `max_tokens` tokens.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            temperature: 0.0,
            max_tokens,
            ..Self::default()
        }
    }
}

/// Model configuration (Llama-style).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (MLP).
    pub intermediate_size: usize,
    /// Number of transformer layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA).
    pub num_key_value_heads: usize,
    /// RMSNorm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// End-of-sequence token, if the vocabulary has one.
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl Default for ModelConfig {
    fn default() -> Self {
        // TinyLlama-1.1B defaults
        Self {
            vocab_size: 32000,
            hidden_size: 2048,
            intermediate_size: 5632,
            num_hidden_layers: 22,
            num_attention_heads: 32,
            num_key_value_heads: 4,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            max_position_embeddings: 2048,
            eos_token_id: Some(2),
        }
    }
}

impl ModelConfig {
    /// A tiny configuration for tests and demos.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            max_position_embeddings: 256,
            eos_token_id: None,
        }
    }

    /// Head dimension (hidden_size / num_attention_heads).
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Number of query heads per KV head group (for GQA).
    pub fn num_kv_groups(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Check that sizes are non-zero and head counts divide evenly.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 {
            return Err(Error::Config(format!(
                "vocab_size and hidden_size must be non-zero, got {} and {}",
                self.vocab_size, self.hidden_size
            )));
        }
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(Error::Config("head counts must be non-zero".into()));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Config(format!(
                "hidden_size {} not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(Error::Config(format!(
                "num_attention_heads {} not divisible by num_key_value_heads {}",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(Error::Config("head_dim must be even for RoPE".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_engine_config_from_json() {
        let json = r#"{
            "scheduler": { "max_num_seqs": 2 },
            "cache": {
                "max_context": 8,
                "overflow_policy": "sliding_window",
                "pressure_policy": "evict_least_recent",
                "memory_budget_bytes": 4096
            },
            "kernels": { "parallel_row_threshold": 128, "force_level": "scalar" }
        }"#;
        let config = EngineConfig::from_json_str(json).unwrap();

        assert_eq!(config.scheduler.max_num_seqs, 2);
        assert_eq!(config.scheduler.max_prefill_tokens, 4096);
        assert_eq!(config.cache.max_context, 8);
        assert_eq!(config.cache.overflow_policy, OverflowPolicy::SlidingWindow);
        assert_eq!(config.cache.pressure_policy, PressurePolicy::EvictLeastRecent);
        assert_eq!(config.cache.memory_budget_bytes, Some(4096));
        assert_eq!(config.kernels.parallel_row_threshold, 128);
        assert_eq!(config.kernels.force_level, Some(SimdLevel::Scalar));
    }

    #[test]
    fn test_invalid_engine_config() {
        let json = r#"{ "scheduler": { "max_num_seqs": 0 } }"#;
        assert!(matches!(
            EngineConfig::from_json_str(json),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_model_config_helpers() {
        let config = ModelConfig::default();
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.num_kv_groups(), 8);
        assert!(config.validate().is_ok());

        let tiny = ModelConfig::tiny();
        assert_eq!(tiny.head_dim(), 8);
        assert_eq!(tiny.num_kv_groups(), 2);
    }

    #[test]
    fn test_model_config_rejects_uneven_heads() {
        let config = ModelConfig {
            num_key_value_heads: 3,
            ..ModelConfig::tiny()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_config_rejects_zero_sizes() {
        for config in [
            ModelConfig {
                vocab_size: 0,
                ..ModelConfig::tiny()
            },
            ModelConfig {
                hidden_size: 0,
                ..ModelConfig::tiny()
            },
        ] {
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
    }
}
