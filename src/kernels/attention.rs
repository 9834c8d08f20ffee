//! Single-query attention over cached keys and values.
//!
//! ```text
//! scores = q · Kᵀ / √d        (attention_scores kernel)
//! probs  = softmax(scores)
//! out    = probs · V          (matmul kernel, 1 × len × d)
//! ```

use super::KernelDispatcher;
use crate::error::{Error, Result};

/// Numerically stable softmax. Non-finite inputs propagate to the output.
pub fn softmax_in_place(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x.iter_mut() {
            *v /= sum;
        }
    }
}

/// Attend one query head over `len` cached positions.
///
/// # Arguments
///
/// * `q` - Query vector `[head_dim]`
/// * `keys` - Cached keys `[len × head_dim]`
/// * `values` - Cached values `[len × head_dim]`
/// * `scores` - Scratch buffer, resized to `len`
/// * `out` - Output `[head_dim]`
pub fn scaled_dot_product_attention(
    kernels: &KernelDispatcher,
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    head_dim: usize,
    scores: &mut Vec<f32>,
    out: &mut [f32],
) -> Result<()> {
    if keys.len() != values.len() {
        return Err(Error::shape("attention values", &[keys.len()], &[values.len()]));
    }
    if out.len() != head_dim {
        return Err(Error::shape("attention out", &[head_dim], &[out.len()]));
    }
    if head_dim == 0 || keys.is_empty() {
        out.fill(0.0);
        return Ok(());
    }

    let len = keys.len() / head_dim;
    scores.clear();
    scores.resize(len, 0.0);
    kernels.attention_scores_into(q, keys, head_dim, scores)?;

    let scale = 1.0 / (head_dim as f32).sqrt();
    scores.iter_mut().for_each(|s| *s *= scale);
    softmax_in_place(scores);

    kernels.matmul_into(scores, values, 1, len, head_dim, out)
}
