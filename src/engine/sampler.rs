//! Token sampling strategies.
//!
//! This module provides sampling methods for selecting the next token
//! from a row of logits:
//!
//! - **Temperature**: Controls randomness (≤ 0 = greedy)
//! - **Top-k**: Limits choices to k most likely tokens
//! - **Top-p (nucleus)**: Limits choices to tokens covering p probability mass
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! (Logits - max) / temperature
//!     │
//!     ▼ Top-k filtering (optional, ties to the lower index)
//! Keep top k tokens
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering (optional)
//! Cumulative prob ≤ p
//!     │
//!     ▼ Weighted draw from the seeded RNG
//! Selected token
//! ```

use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Token sampler with configurable sampling strategies.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for scaling logits.
    temperature: f32,
    /// Top-k value (0 = disabled).
    top_k: usize,
    /// Top-p value (1.0 = disabled).
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Creates a sampler seeded from `config.seed`, or from entropy if unset.
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Sample a token from one row of logits.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidRequest`] for an empty row.
    /// * [`Error::NumericInstability`] if any logit is NaN or infinite.
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(Error::InvalidRequest("cannot sample from empty logits".into()));
        }
        if let Some(i) = logits.iter().position(|x| !x.is_finite()) {
            return Err(Error::NumericInstability(format!(
                "logit {i} is {}",
                logits[i]
            )));
        }

        if self.is_greedy() {
            return Ok(argmax(logits));
        }

        // Shifted so the largest scaled logit is 0 and tiny temperatures
        // push the rest towards -inf instead of overflowing
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let scaled: Vec<f32> = logits
            .iter()
            .map(|&x| (x - max) / self.temperature)
            .collect();

        // Candidates sorted by logit descending, ties to the lower index
        let mut candidates: Vec<usize> = (0..scaled.len()).collect();
        candidates.sort_by(|&a, &b| scaled[b].total_cmp(&scaled[a]).then(a.cmp(&b)));
        if self.top_k > 0 && self.top_k < candidates.len() {
            candidates.truncate(self.top_k);
        }

        let probs = softmax(&candidates.iter().map(|&i| scaled[i]).collect::<Vec<_>>());
        let keep = if self.top_p > 0.0 && self.top_p < 1.0 {
            nucleus_len(&probs, self.top_p)
        } else {
            probs.len()
        };

        let dist = WeightedIndex::new(&probs[..keep]).map_err(|e| {
            Error::NumericInstability(format!("failed to build sampling distribution: {e}"))
        })?;
        Ok(candidates[dist.sample(&mut self.rng)] as u32)
    }

    /// Set temperature.
    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
    }

    /// Set top-k.
    pub fn set_top_k(&mut self, top_k: usize) {
        self.top_k = top_k;
    }

    /// Set top-p.
    pub fn set_top_p(&mut self, top_p: f32) {
        self.top_p = top_p;
    }
}

/// Index of the largest logit; the lower index wins ties.
fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &x) in logits.iter().enumerate().skip(1) {
        if x > logits[best] {
            best = i;
        }
    }
    best as u32
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Number of leading (descending) probabilities kept by nucleus filtering:
/// up to and including the one that pushes the cumulative mass past `p`.
fn nucleus_len(probs: &[f32], p: f32) -> usize {
    let mut cumulative = 0.0f32;
    for (i, &prob) in probs.iter().enumerate() {
        cumulative += prob;
        if cumulative > p {
            return i + 1;
        }
    }
    probs.len()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn config(temperature: f32, top_k: usize, top_p: f32) -> SamplingConfig {
        SamplingConfig {
            temperature,
            top_k,
            top_p,
            max_tokens: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_greedy_sampling() {
        let mut sampler = Sampler::with_seed(&config(0.0, 0, 1.0), 42);
        assert_eq!(sampler.sample(&[0.1, 0.2, 0.3, 10.0, 0.4]).unwrap(), 3);
    }

    #[test]
    fn test_greedy_ties_to_lower_index() {
        let mut sampler = Sampler::with_seed(&config(0.0, 0, 1.0), 42);
        assert_eq!(sampler.sample(&[1.0, 5.0, 5.0, 2.0]).unwrap(), 1);
    }

    #[test]
    fn test_temperature_sampling() {
        let mut sampler = Sampler::with_seed(&config(1.0, 0, 1.0), 42);
        let logits = [1.0f32; 5];

        let seen: HashSet<u32> = (0..100).map(|_| sampler.sample(&logits).unwrap()).collect();
        assert!(seen.len() > 1, "Should sample different tokens");
    }

    #[test]
    fn test_tiny_temperature_picks_the_largest_logit() {
        let mut sampler = Sampler::with_seed(&config(1e-40, 0, 1.0), 7);
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[1.0, 2.0, 3.0]).unwrap(), 2);
        }
    }

    #[test]
    fn test_extreme_logits_stay_finite_after_scaling() {
        let mut sampler = Sampler::with_seed(&config(0.5, 0, 1.0), 7);
        assert_eq!(sampler.sample(&[-3.0e38, 3.0e38, 0.0]).unwrap(), 1);
    }

    #[test]
    fn test_top_k_sampling() {
        let mut sampler = Sampler::with_seed(&config(1.0, 2, 1.0), 42);
        let logits = [0.1f32, 0.2, 0.3, 10.0, 9.0];

        for _ in 0..50 {
            let token = sampler.sample(&logits).unwrap();
            assert!(token == 3 || token == 4);
        }
    }

    #[test]
    fn test_top_k_ties_keep_lower_index() {
        let mut sampler = Sampler::with_seed(&config(1.0, 1, 1.0), 42);
        for _ in 0..20 {
            assert_eq!(sampler.sample(&[0.0, 3.0, 3.0, 3.0]).unwrap(), 1);
        }
    }

    #[test]
    fn test_top_p_sampling() {
        let mut sampler = Sampler::with_seed(&config(1.0, 0, 0.5), 42);
        let logits = [0.0f32, 0.0, 0.0, 10.0, 0.0];
        for _ in 0..10 {
            assert_eq!(sampler.sample(&logits).unwrap(), 3);
        }
    }

    #[test]
    fn test_nucleus_len() {
        assert_eq!(nucleus_len(&[0.5, 0.3, 0.2], 0.6), 2);
        assert_eq!(nucleus_len(&[0.5, 0.3, 0.2], 0.4), 1);
        assert_eq!(nucleus_len(&[0.5, 0.3, 0.2], 0.99), 3);
    }

    #[test]
    fn test_reproducibility_with_seed() {
        let logits = [1.0f32; 5];
        let cfg = SamplingConfig {
            seed: Some(12345),
            ..config(1.0, 0, 1.0)
        };
        let mut sampler1 = Sampler::new(&cfg);
        let mut sampler2 = Sampler::new(&cfg);

        let tokens1: Vec<u32> = (0..10).map(|_| sampler1.sample(&logits).unwrap()).collect();
        let tokens2: Vec<u32> = (0..10).map(|_| sampler2.sample(&logits).unwrap()).collect();
        assert_eq!(tokens1, tokens2, "Same seed should produce same sequence");
    }

    #[test]
    fn test_non_finite_logits_rejected() {
        let mut sampler = Sampler::with_seed(&config(0.0, 0, 1.0), 1);
        assert!(matches!(
            sampler.sample(&[0.0, f32::NAN]),
            Err(Error::NumericInstability(_))
        ));
        assert!(matches!(
            sampler.sample(&[f32::INFINITY, 0.0]),
            Err(Error::NumericInstability(_))
        ));
        assert!(matches!(sampler.sample(&[]), Err(Error::InvalidRequest(_))));
    }
}
