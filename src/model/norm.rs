//! RMS Normalization implementation.
//!
//! Root Mean Square Layer Normalization rescales inputs by their RMS value,
//! without centering (no mean subtraction).
//!
//! Reference: <https://arxiv.org/abs/1910.07467>

use crate::error::{Error, Result};

/// RMS Normalization layer.
///
/// Formula: `output = (x / rms(x)) * weight`
/// where `rms(x) = sqrt(mean(x^2) + eps)`
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter [hidden_size].
    weight: Vec<f32>,
    /// Small constant for numerical stability.
    eps: f32,
}

impl RmsNorm {
    /// Creates a new RmsNorm layer.
    ///
    /// # Arguments
    ///
    /// * `weight` - Learnable scale of length hidden_size
    /// * `eps` - Small constant for numerical stability (typically 1e-5)
    pub fn new(weight: Vec<f32>, eps: f64) -> Self {
        Self {
            weight,
            eps: eps as f32,
        }
    }

    /// Creates a new RmsNorm layer with ones as weights.
    pub fn new_ones(hidden_size: usize, eps: f64) -> Self {
        Self::new(vec![1.0; hidden_size], eps)
    }

    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Normalize every `hidden_size`-wide row of `x`.
    ///
    /// ```text
    /// rms = sqrt(mean(x^2) + eps)
    /// output = (x / rms) * weight
    /// ```
    pub fn forward(&self, x: &[f32]) -> Result<Vec<f32>> {
        let hidden = self.weight.len();
        if hidden == 0 || x.len() % hidden != 0 {
            return Err(Error::shape("rms_norm", &[hidden], &[x.len()]));
        }
        let mut out = vec![0.0f32; x.len()];
        for (src, dst) in x.chunks_exact(hidden).zip(out.chunks_exact_mut(hidden)) {
            let mean_sq = src.iter().map(|v| v * v).sum::<f32>() / hidden as f32;
            let inv_rms = 1.0 / (mean_sq + self.eps).sqrt();
            for ((d, &s), &w) in dst.iter_mut().zip(src).zip(&self.weight) {
                *d = s * inv_rms * w;
            }
        }
        Ok(out)
    }
}
