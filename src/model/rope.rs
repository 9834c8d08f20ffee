//! Rotary Position Embeddings (RoPE) implementation.
//!
//! RoPE encodes position information by rotating pairs of elements in the
//! query and key vectors, so the dot product of a rotated query and key
//! depends only on their relative position.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

/// Rotary Position Embedding.
///
/// Uses the rotate-half convention: element `i` is paired with `i + dim/2`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// 1 / theta^(2i/dim) for i in 0..dim/2.
    inv_freq: Vec<f32>,
    /// Precomputed cosine values [max_seq_len × dim/2].
    cos_cache: Vec<f32>,
    /// Precomputed sine values [max_seq_len × dim/2].
    sin_cache: Vec<f32>,
    /// Head dimension (must be even for rotation pairs).
    dim: usize,
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Creates a new RotaryEmbedding with precomputed cos/sin caches.
    ///
    /// # Arguments
    ///
    /// * `dim` - Head dimension (even; validated by `ModelConfig::validate`)
    /// * `max_seq_len` - Positions to precompute; later ones are computed on demand
    /// * `theta` - Base frequency (typically 10000)
    pub fn new(dim: usize, max_seq_len: usize, theta: f64) -> Self {
        let half = dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / dim as f64) as f32)
            .collect();

        let mut cos_cache = Vec::with_capacity(max_seq_len * half);
        let mut sin_cache = Vec::with_capacity(max_seq_len * half);
        for pos in 0..max_seq_len {
            for &f in &inv_freq {
                let angle = pos as f32 * f;
                cos_cache.push(angle.cos());
                sin_cache.push(angle.sin());
            }
        }

        Self {
            inv_freq,
            cos_cache,
            sin_cache,
            dim,
            max_seq_len,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Rotate one head vector in place at absolute `position`.
    ///
    /// ```text
    /// x_rot = x * cos + rotate_half(x) * sin
    /// rotate_half([x1, x2]) = [-x2, x1]
    /// ```
    pub fn apply(&self, x: &mut [f32], position: usize) {
        let half = self.dim / 2;
        debug_assert_eq!(x.len(), self.dim);
        let (x1, x2) = x.split_at_mut(half);

        if position < self.max_seq_len {
            let cos = &self.cos_cache[position * half..(position + 1) * half];
            let sin = &self.sin_cache[position * half..(position + 1) * half];
            for i in 0..half {
                let (a, b) = (x1[i], x2[i]);
                x1[i] = a * cos[i] - b * sin[i];
                x2[i] = b * cos[i] + a * sin[i];
            }
        } else {
            for i in 0..half {
                let angle = position as f32 * self.inv_freq[i];
                let (sin, cos) = angle.sin_cos();
                let (a, b) = (x1[i], x2[i]);
                x1[i] = a * cos - b * sin;
                x2[i] = b * cos + a * sin;
            }
        }
    }

    /// Rotate every head of a `[num_heads × dim]` row.
    pub fn apply_heads(&self, row: &mut [f32], position: usize) {
        for head in row.chunks_exact_mut(self.dim) {
            self.apply(head, position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_position_zero_is_identity() {
        let rope = RotaryEmbedding::new(4, 16, 10000.0);
        let mut x = [1.0, 2.0, 3.0, 4.0];
        rope.apply(&mut x, 0);
        assert_eq!(x, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let rope = RotaryEmbedding::new(8, 16, 10000.0);
        let mut x = [0.5, -1.0, 2.0, 0.25, 1.5, -0.5, 0.0, 3.0];
        let before = dot(&x, &x);
        rope.apply(&mut x, 7);
        assert!((dot(&x, &x) - before).abs() < 1e-4);
    }

    #[test]
    fn test_relative_position_property() {
        let rope = RotaryEmbedding::new(4, 64, 10000.0);
        let q = [0.3, -0.7, 1.1, 0.2];
        let k = [0.9, 0.4, -0.6, 1.3];

        let score = |pq: usize, pk: usize| {
            let (mut q, mut k) = (q, k);
            rope.apply(&mut q, pq);
            rope.apply(&mut k, pk);
            dot(&q, &k)
        };
        assert!((score(5, 2) - score(13, 10)).abs() < 1e-4);
    }

    #[test]
    fn test_positions_past_cache_match_cached_math() {
        let cached = RotaryEmbedding::new(4, 64, 10000.0);
        let short = RotaryEmbedding::new(4, 8, 10000.0);
        let mut a = [1.0, 2.0, 3.0, 4.0];
        let mut b = a;
        cached.apply(&mut a, 20);
        short.apply(&mut b, 20);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}
