//! Llama-style decoder-only transformer.
//!
//! ## Architecture
//!
//! ```text
//! Token IDs of every sequence in the batch, concatenated
//!       │
//!       ▼
//! ┌───────────────┐
//! │  Embedding    │  vocab_size → hidden_size
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │ DecoderLayer  │ × num_hidden_layers   (one GEMM per projection for all rows)
//! └───────────────┘
//!       │  last row of each sequence
//!       ▼
//! ┌───────────────┐
//! │   RMSNorm     │
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │   LM Head     │  hidden_size → vocab_size
//! └───────────────┘
//!       │
//!       ▼
//! Logits, one row per sequence
//! ```

use log::info;

use crate::config::ModelConfig;
use crate::core::kv_cache::{KvCacheManager, SlotId};
use crate::core::tensor::Tensor;
use crate::error::{Error, Result};
use crate::kernels::KernelDispatcher;

use super::attention::{Attention, BatchContext, RowSpan};
use super::decoder::DecoderLayer;
use super::linear::Linear;
use super::loader::ModelWeights;
use super::mlp::Mlp;
use super::norm::RmsNorm;
use super::rope::RotaryEmbedding;

/// One sequence's share of a batched forward pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Cache slot that receives this sequence's keys and values.
    pub slot: SlotId,
    /// Tokens to feed: the uncached prompt for prefill, the last token for decode.
    pub tokens: Vec<u32>,
}

/// A model the engine can drive one tick at a time.
pub trait CausalLm: Send {
    fn config(&self) -> &ModelConfig;

    /// Run every entry through the model in one invocation, appending their
    /// keys and values to the cache, and return next-token logits per entry.
    fn forward_batch(
        &self,
        cache: &mut KvCacheManager,
        entries: &[BatchEntry],
    ) -> Result<Vec<Vec<f32>>>;
}

/// Decoder-only transformer built on the dispatched kernels.
#[derive(Debug, Clone)]
pub struct Transformer {
    config: ModelConfig,
    kernels: KernelDispatcher,
    /// Token embeddings `[vocab × hidden]`.
    embed_tokens: Vec<f32>,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
}

impl Transformer {
    /// Assemble the model from decoded weights.
    ///
    /// # Arguments
    ///
    /// * `config` - Model configuration
    /// * `weights` - Decoded tensors; consumed
    /// * `kernels` - Dispatcher for every matmul
    /// * `dequantize_at_load` - Expand quantized projections now
    pub fn from_weights(
        config: ModelConfig,
        mut weights: ModelWeights,
        kernels: KernelDispatcher,
        dequantize_at_load: bool,
    ) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let head_dim = config.head_dim();
        let q_width = config.num_attention_heads * head_dim;
        let kv_width = config.num_key_value_heads * head_dim;
        let eps = config.rms_norm_eps;

        let embed_tokens = weights
            .take("embed_tokens", &[config.vocab_size, hidden])?
            .to_f32_vec()?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        let mut quantized = 0usize;
        for i in 0..config.num_hidden_layers {
            let p = format!("layers.{i}");
            let mut linear = |name: &str, out: usize, inp: usize| -> Result<Linear> {
                let linear = Linear::from_tensor(
                    weights.take(&format!("{p}.{name}"), &[out, inp])?,
                    dequantize_at_load,
                )?;
                if linear.is_quantized() {
                    quantized += 1;
                }
                Ok(linear)
            };
            let attn = Attention::new(
                linear("self_attn.q_proj", q_width, hidden)?,
                linear("self_attn.k_proj", kv_width, hidden)?,
                linear("self_attn.v_proj", kv_width, hidden)?,
                linear("self_attn.o_proj", hidden, q_width)?,
                config.num_attention_heads,
                config.num_key_value_heads,
                head_dim,
                i,
            );
            let mlp = Mlp::new(
                linear("mlp.gate_proj", inter, hidden)?,
                linear("mlp.up_proj", inter, hidden)?,
                linear("mlp.down_proj", hidden, inter)?,
            );

            let input_norm = weights
                .take(&format!("{p}.input_layernorm"), &[hidden])?
                .to_f32_vec()?;
            let post_norm = weights
                .take(&format!("{p}.post_attention_layernorm"), &[hidden])?
                .to_f32_vec()?;
            layers.push(DecoderLayer::new(
                RmsNorm::new(input_norm, eps),
                attn,
                RmsNorm::new(post_norm, eps),
                mlp,
            ));
        }

        let norm = RmsNorm::new(weights.take("norm", &[hidden])?.to_f32_vec()?, eps);
        let lm_head = if weights.contains("lm_head") {
            Linear::from_tensor(
                weights.take("lm_head", &[config.vocab_size, hidden])?,
                dequantize_at_load,
            )?
        } else {
            Linear::from_tensor(
                Tensor::from_vec(embed_tokens.clone(), vec![config.vocab_size, hidden])?,
                true,
            )?
        };

        let rope = RotaryEmbedding::new(head_dim, config.max_position_embeddings, config.rope_theta);
        info!(
            "transformer ready: {} layers, hidden {}, {} heads / {} kv heads, {} quantized projections, kernels {}",
            config.num_hidden_layers,
            hidden,
            config.num_attention_heads,
            config.num_key_value_heads,
            quantized,
            kernels.level()
        );

        Ok(Self {
            config,
            kernels,
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
        })
    }

    pub fn kernels(&self) -> &KernelDispatcher {
        &self.kernels
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn embed(&self, tokens: &[u32], out: &mut Vec<f32>) -> Result<()> {
        let hidden = self.config.hidden_size;
        for &token in tokens {
            let t = token as usize;
            if t >= self.config.vocab_size {
                return Err(Error::InvalidRequest(format!(
                    "token {token} outside vocabulary of {}",
                    self.config.vocab_size
                )));
            }
            out.extend_from_slice(&self.embed_tokens[t * hidden..(t + 1) * hidden]);
        }
        Ok(())
    }
}

impl CausalLm for Transformer {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward_batch(
        &self,
        cache: &mut KvCacheManager,
        entries: &[BatchEntry],
    ) -> Result<Vec<Vec<f32>>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let hidden = self.config.hidden_size;

        let mut spans = Vec::with_capacity(entries.len());
        let mut hidden_states = Vec::new();
        let mut rows = 0;
        for entry in entries {
            if entry.tokens.is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "empty batch entry for slot {}",
                    entry.slot
                )));
            }
            self.embed(&entry.tokens, &mut hidden_states)?;
            spans.push(RowSpan {
                slot: entry.slot,
                start_row: rows,
                len: entry.tokens.len(),
                start_pos: cache.next_position(entry.slot)?,
            });
            rows += entry.tokens.len();
        }

        let ctx = BatchContext {
            kernels: &self.kernels,
            rope: &self.rope,
            spans: &spans,
            rows,
        };
        for layer in &self.layers {
            layer.forward(&ctx, cache, &mut hidden_states)?;
        }

        let mut last_rows = Vec::with_capacity(spans.len() * hidden);
        for span in &spans {
            let r = span.start_row + span.len - 1;
            last_rows.extend_from_slice(&hidden_states[r * hidden..(r + 1) * hidden]);
        }
        let normed = self.norm.forward(&last_rows)?;
        let logits = self.lm_head.forward(&self.kernels, &normed, spans.len())?;

        Ok(logits
            .chunks_exact(self.config.vocab_size)
            .map(<[f32]>::to_vec)
            .collect())
    }
}
