//! Grouped-query self-attention over the per-sequence KV cache.
//!
//! The projections run once over every row of the batch. Attention itself is
//! per sequence: each row is rotated, appended to its sequence's slot, and
//! then attends over everything that slot holds. Appending before attending
//! makes the pass causal without a mask.
//!
//! ```text
//!             x [T × hidden]          (rows of every sequence in the batch)
//!        ┌──────────┼──────────┐
//!      q_proj     k_proj     v_proj   one GEMM each
//!        │          │          │
//!        │      RoPE + append ─┘      per row, into that row's slot
//!        │          │
//!        └── attend over slot ──► o_proj
//! ```

use crate::core::kv_cache::{KvCacheManager, SlotId};
use crate::error::Result;
use crate::kernels::{KernelDispatcher, scaled_dot_product_attention};

use super::linear::Linear;
use super::rope::RotaryEmbedding;

/// Rows of the batch activation matrix that belong to one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSpan {
    pub slot: SlotId,
    /// First row in the activation matrix.
    pub start_row: usize,
    pub len: usize,
    /// Absolute position of the first row.
    pub start_pos: usize,
}

/// Shared inputs of one batched forward pass.
#[derive(Debug, Clone, Copy)]
pub struct BatchContext<'a> {
    pub kernels: &'a KernelDispatcher,
    pub rope: &'a RotaryEmbedding,
    pub spans: &'a [RowSpan],
    /// Total rows across spans.
    pub rows: usize,
}

/// Self-attention for one layer.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    layer_idx: usize,
}

impl Attention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        o_proj: Linear,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        layer_idx: usize,
    ) -> Self {
        Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
            layer_idx,
        }
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Attend every row of `x` and project back to the hidden size.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Kernels, rotary tables and row spans for this batch
    /// * `cache` - Receives one key/value position per row
    /// * `x` - Normalized hidden states `[ctx.rows × hidden]`
    pub fn forward(
        &self,
        ctx: &BatchContext<'_>,
        cache: &mut KvCacheManager,
        x: &[f32],
    ) -> Result<Vec<f32>> {
        let d = self.head_dim;
        let q_width = self.num_heads * d;
        let kv_width = self.num_kv_heads * d;
        let groups = (self.num_heads / self.num_kv_heads).max(1);

        let mut q = self.q_proj.forward(ctx.kernels, x, ctx.rows)?;
        let mut k = self.k_proj.forward(ctx.kernels, x, ctx.rows)?;
        let v = self.v_proj.forward(ctx.kernels, x, ctx.rows)?;

        let mut out = vec![0.0f32; ctx.rows * q_width];
        let mut scores = Vec::new();

        for span in ctx.spans {
            for t in 0..span.len {
                let row = span.start_row + t;
                let position = span.start_pos + t;

                let q_row = &mut q[row * q_width..(row + 1) * q_width];
                let k_row = &mut k[row * kv_width..(row + 1) * kv_width];
                ctx.rope.apply_heads(q_row, position);
                ctx.rope.apply_heads(k_row, position);

                cache.append(
                    span.slot,
                    self.layer_idx,
                    k_row,
                    &v[row * kv_width..(row + 1) * kv_width],
                )?;

                let view = cache.read(span.slot, self.layer_idx)?;
                let q_row = &q[row * q_width..(row + 1) * q_width];
                let out_row = &mut out[row * q_width..(row + 1) * q_width];
                for (h, (q_head, out_head)) in q_row
                    .chunks_exact(d)
                    .zip(out_row.chunks_exact_mut(d))
                    .enumerate()
                {
                    let kv_head = h / groups;
                    scaled_dot_product_attention(
                        ctx.kernels,
                        q_head,
                        view.keys(kv_head),
                        view.values(kv_head),
                        d,
                        &mut scores,
                        out_head,
                    )?;
                }
            }
        }

        self.o_proj.forward(ctx.kernels, &out, ctx.rows)
    }
}
