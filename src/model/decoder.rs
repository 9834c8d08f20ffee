//! Decoder layer: self-attention and MLP with residual connections and
//! pre-norm architecture.

use crate::core::kv_cache::KvCacheManager;
use crate::error::Result;

use super::attention::{Attention, BatchContext};
use super::mlp::Mlp;
use super::norm::RmsNorm;

/// Decoder Layer.
///
/// Each layer consists of:
/// 1. Input layer norm -> Self-attention -> Residual add
/// 2. Post-attention layer norm -> MLP -> Residual add
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    pub fn new(
        input_layernorm: RmsNorm,
        self_attn: Attention,
        post_attention_layernorm: RmsNorm,
        mlp: Mlp,
    ) -> Self {
        Self {
            input_layernorm,
            self_attn,
            post_attention_layernorm,
            mlp,
        }
    }

    pub fn self_attn(&self) -> &Attention {
        &self.self_attn
    }

    pub fn mlp(&self) -> &Mlp {
        &self.mlp
    }

    /// Forward pass through the decoder layer.
    ///
    /// ```text
    /// Input (hidden_states)
    ///    │
    ///    ├───────────────────────────┐ (residual)
    ///    ▼                           │
    /// input_layernorm → self_attn    │
    ///    ▼                           │
    ///    + ◄─────────────────────────┘
    ///    │
    ///    ├───────────────────────────┐ (residual)
    ///    ▼                           │
    /// post_attention_layernorm → mlp │
    ///    ▼                           │
    ///    + ◄─────────────────────────┘
    ///    ▼
    /// Output
    /// ```
    pub fn forward(
        &self,
        ctx: &BatchContext<'_>,
        cache: &mut KvCacheManager,
        hidden_states: &mut [f32],
    ) -> Result<()> {
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn = self.self_attn.forward(ctx, cache, &normed)?;
        for (h, a) in hidden_states.iter_mut().zip(&attn) {
            *h += a;
        }

        let normed = self.post_attention_layernorm.forward(hidden_states)?;
        let mlp = self.mlp.forward(ctx.kernels, &normed, ctx.rows)?;
        for (h, m) in hidden_states.iter_mut().zip(&mlp) {
            *h += m;
        }
        Ok(())
    }
}
