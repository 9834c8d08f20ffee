//! CPU kernel selection and the safe entry points for matmul and attention.
//!
//! The dispatcher detects host features once, binds the widest supported variant as
//! a strategy object, and keeps it for its whole lifetime. Every public entry
//! point validates buffer lengths once per call and then hands raw slices to
//! the bound variant.
//!
//! ## Variants
//!
//! ```text
//! widest ─────────────────────────────────────────────────────► narrowest
//!  Avx512 (512)   Avx2Fma (256 + fma)   Avx (256)   Sse / Neon (128)   Scalar
//! ```
//!
//! ## Example
//!
//! ```
//! use nano_infer::kernels::KernelDispatcher;
//! use nano_infer::KernelConfig;
//!
//! let kernels = KernelDispatcher::new(KernelConfig::default()).unwrap();
//! let a = [1.0, 2.0, 3.0, 4.0];
//! let identity = [1.0, 0.0, 0.0, 1.0];
//! let c = kernels.matmul(&a, &identity, 2, 2, 2).unwrap();
//! assert_eq!(c, vec![1.0, 2.0, 3.0, 4.0]);
//! ```

pub mod attention;
mod scalar;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86;

use std::fmt;
use std::sync::OnceLock;

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::KernelConfig;
use crate::error::{Error, Result};

pub use attention::{scaled_dot_product_attention, softmax_in_place};

/// Vector instruction width a kernel variant is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimdLevel {
    /// 512-bit AVX-512F.
    Avx512,
    /// 256-bit AVX2 with fused multiply-add.
    Avx2Fma,
    /// 256-bit AVX without FMA.
    Avx,
    /// 128-bit SSE2.
    Sse,
    /// 128-bit ARM NEON.
    Neon,
    /// Portable fallback.
    Scalar,
}

/// Detection order, widest first.
const DETECTION_ORDER: [SimdLevel; 6] = [
    SimdLevel::Avx512,
    SimdLevel::Avx2Fma,
    SimdLevel::Avx,
    SimdLevel::Sse,
    SimdLevel::Neon,
    SimdLevel::Scalar,
];

static DETECTED: OnceLock<SimdLevel> = OnceLock::new();

impl SimdLevel {
    /// Widest variant the host supports. Detected once per process.
    pub fn detect() -> Self {
        *DETECTED.get_or_init(|| {
            DETECTION_ORDER
                .into_iter()
                .find(|level| level.is_supported())
                .unwrap_or(SimdLevel::Scalar)
        })
    }

    /// Every variant this host can execute, widest first.
    pub fn available() -> Vec<Self> {
        DETECTION_ORDER
            .into_iter()
            .filter(|level| level.is_supported())
            .collect()
    }

    /// Whether the host can execute this variant.
    pub fn is_supported(&self) -> bool {
        match self {
            #[cfg(target_arch = "x86_64")]
            Self::Avx512 => is_x86_feature_detected!("avx512f"),
            #[cfg(target_arch = "x86_64")]
            Self::Avx2Fma => is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma"),
            #[cfg(target_arch = "x86_64")]
            Self::Avx => is_x86_feature_detected!("avx"),
            #[cfg(target_arch = "x86_64")]
            Self::Sse => is_x86_feature_detected!("sse2"),
            #[cfg(target_arch = "aarch64")]
            Self::Neon => std::arch::is_aarch64_feature_detected!("neon"),
            Self::Scalar => true,
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    /// Register width in bits (0 for the scalar fallback).
    pub fn width_bits(&self) -> usize {
        match self {
            Self::Avx512 => 512,
            Self::Avx2Fma | Self::Avx => 256,
            Self::Sse | Self::Neon => 128,
            Self::Scalar => 0,
        }
    }

    /// Short name for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avx512 => "avx512",
            Self::Avx2Fma => "avx2_fma",
            Self::Avx => "avx",
            Self::Sse => "sse",
            Self::Neon => "neon",
            Self::Scalar => "scalar",
        }
    }
}

impl fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One vector-width implementation of the inner loops.
///
/// Callers guarantee the length contracts; implementations only
/// `debug_assert` them.
pub(crate) trait MicroKernel: Send + Sync {
    fn level(&self) -> SimdLevel;

    /// `c_row = a_row · B` where B is row-major `[a_row.len() × c_row.len()]`.
    fn gemm_row(&self, a_row: &[f32], b: &[f32], c_row: &mut [f32]);

    /// Inner product of two equal-length slices.
    fn dot(&self, x: &[f32], y: &[f32]) -> f32;
}

/// Resolve a level to its kernel, or `None` when the host cannot run it.
fn bind(level: SimdLevel) -> Option<&'static dyn MicroKernel> {
    if !level.is_supported() {
        return None;
    }
    match level {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx512 => Some(&x86::AVX512),
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2Fma => Some(&x86::AVX2_FMA),
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx => Some(&x86::AVX),
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse => Some(&x86::SSE),
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => Some(&aarch64::NEON),
        SimdLevel::Scalar => Some(&scalar::SCALAR),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Matmul and attention-score entry points bound to one kernel variant.
#[derive(Clone)]
pub struct KernelDispatcher {
    kernel: &'static dyn MicroKernel,
    config: KernelConfig,
}

impl fmt::Debug for KernelDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDispatcher")
            .field("level", &self.kernel.level())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for KernelDispatcher {
    fn default() -> Self {
        Self {
            kernel: bind(SimdLevel::detect()).unwrap_or(&scalar::SCALAR),
            config: KernelConfig::default(),
        }
    }
}

impl KernelDispatcher {
    /// Bind the variant named by `config.force_level`, or the widest detected.
    pub fn new(config: KernelConfig) -> Result<Self> {
        let level = config.force_level.unwrap_or_else(SimdLevel::detect);
        Self::with_level(level, config)
    }

    /// Bind a specific variant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedKernel`] if the host cannot run `level`.
    pub fn with_level(level: SimdLevel, config: KernelConfig) -> Result<Self> {
        let kernel = bind(level).ok_or(Error::UnsupportedKernel(level.as_str()))?;
        info!(
            "kernel dispatcher bound to {} (parallel rows >= {}, tiny work <= {})",
            level, config.parallel_row_threshold, config.tiny_work_threshold
        );
        Ok(Self { kernel, config })
    }

    /// The bound variant.
    pub fn level(&self) -> SimdLevel {
        self.kernel.level()
    }

    /// The tuning values this dispatcher was built with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// `C = A · B` for row-major `A [m × k]` and `B [k × n]`.
    pub fn matmul(&self, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
        let mut c = vec![0.0; m * n];
        self.matmul_into(a, b, m, k, n, &mut c)?;
        Ok(c)
    }

    /// `C = A · B` written into a caller-provided `[m × n]` buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] before touching `c` if any buffer
    /// length disagrees with `(m, k, n)`.
    pub fn matmul_into(
        &self,
        a: &[f32],
        b: &[f32],
        m: usize,
        k: usize,
        n: usize,
        c: &mut [f32],
    ) -> Result<()> {
        if a.len() != m * k {
            return Err(Error::shape("matmul lhs", &[m, k], &[a.len()]));
        }
        if b.len() != k * n {
            return Err(Error::shape("matmul rhs", &[k, n], &[b.len()]));
        }
        if c.len() != m * n {
            return Err(Error::shape("matmul out", &[m, n], &[c.len()]));
        }
        if m == 0 || n == 0 {
            return Ok(());
        }
        if k == 0 {
            c.fill(0.0);
            return Ok(());
        }
        if m * k * n <= self.config.tiny_work_threshold {
            scalar::gemm_direct(a, b, m, k, n, c);
            return Ok(());
        }

        let kernel = self.kernel;
        if self.should_split(m) {
            let rows = m.div_ceil(rayon::current_num_threads());
            c.par_chunks_mut(rows * n)
                .zip(a.par_chunks(rows * k))
                .for_each(|(c_rows, a_rows)| {
                    for (c_row, a_row) in c_rows.chunks_exact_mut(n).zip(a_rows.chunks_exact(k)) {
                        kernel.gemm_row(a_row, b, c_row);
                    }
                });
        } else {
            for (c_row, a_row) in c.chunks_exact_mut(n).zip(a.chunks_exact(k)) {
                kernel.gemm_row(a_row, b, c_row);
            }
        }
        Ok(())
    }

    /// `C = A · Bᵀ` for row-major `A [m × k]` and `B [n × k]`.
    pub fn matmul_transposed_into(
        &self,
        a: &[f32],
        bt: &[f32],
        m: usize,
        k: usize,
        n: usize,
        c: &mut [f32],
    ) -> Result<()> {
        if a.len() != m * k {
            return Err(Error::shape("matmul_transposed lhs", &[m, k], &[a.len()]));
        }
        if bt.len() != n * k {
            return Err(Error::shape("matmul_transposed rhs", &[n, k], &[bt.len()]));
        }
        if c.len() != m * n {
            return Err(Error::shape("matmul_transposed out", &[m, n], &[c.len()]));
        }
        if m == 0 || n == 0 {
            return Ok(());
        }
        if k == 0 {
            c.fill(0.0);
            return Ok(());
        }

        let kernel = self.kernel;
        let row = |c_row: &mut [f32], a_row: &[f32]| {
            for (out, b_row) in c_row.iter_mut().zip(bt.chunks_exact(k)) {
                *out = kernel.dot(a_row, b_row);
            }
        };
        if self.should_split(m) {
            c.par_chunks_mut(n)
                .zip(a.par_chunks(k))
                .for_each(|(c_row, a_row)| row(c_row, a_row));
        } else {
            for (c_row, a_row) in c.chunks_exact_mut(n).zip(a.chunks_exact(k)) {
                row(c_row, a_row);
            }
        }
        Ok(())
    }

    /// Dot product of `q` against each `head_size`-wide row of `keys`.
    pub fn attention_scores(&self, q: &[f32], keys: &[f32], head_size: usize) -> Result<Vec<f32>> {
        let len = if head_size == 0 { 0 } else { keys.len() / head_size };
        let mut scores = vec![0.0; len];
        self.attention_scores_into(q, keys, head_size, &mut scores)?;
        Ok(scores)
    }

    /// [`attention_scores`](Self::attention_scores) into a caller buffer of
    /// one score per cached key.
    pub fn attention_scores_into(
        &self,
        q: &[f32],
        keys: &[f32],
        head_size: usize,
        scores: &mut [f32],
    ) -> Result<()> {
        if head_size == 0 || q.len() != head_size {
            return Err(Error::shape("attention_scores query", &[head_size], &[q.len()]));
        }
        if keys.len() != scores.len() * head_size {
            return Err(Error::shape(
                "attention_scores keys",
                &[scores.len(), head_size],
                &[keys.len()],
            ));
        }
        for (score, key) in scores.iter_mut().zip(keys.chunks_exact(head_size)) {
            *score = self.kernel.dot(q, key);
        }
        Ok(())
    }

    /// Inner product of two equal-length slices.
    pub fn dot(&self, x: &[f32], y: &[f32]) -> Result<f32> {
        if x.len() != y.len() {
            return Err(Error::shape("dot", &[x.len()], &[y.len()]));
        }
        Ok(self.kernel.dot(x, y))
    }

    fn should_split(&self, rows: usize) -> bool {
        rows >= self.config.parallel_row_threshold && rayon::current_num_threads() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut c = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
            }
        }
        c
    }

    fn make_input(len: usize, seed: usize) -> Vec<f32> {
        (0..len)
            .map(|i| ((i * 7 + seed) % 97) as f32 * 0.01 - 0.48)
            .collect()
    }

    #[test]
    fn test_detect_is_stable_and_available() {
        let level = SimdLevel::detect();
        assert_eq!(level, SimdLevel::detect());
        assert!(level.is_supported());
        assert!(SimdLevel::available().contains(&level));
        assert!(SimdLevel::available().contains(&SimdLevel::Scalar));
    }

    #[test]
    fn test_level_names() {
        assert_eq!(SimdLevel::Avx2Fma.to_string(), "avx2_fma");
        assert_eq!(SimdLevel::Avx512.width_bits(), 512);
        assert_eq!(SimdLevel::Scalar.width_bits(), 0);
    }

    #[test]
    fn test_every_variant_matches_reference() {
        let (m, k, n) = (5, 37, 70);
        let a = make_input(m * k, 1);
        let b = make_input(k * n, 2);
        let expected = reference(&a, &b, m, k, n);

        for level in SimdLevel::available() {
            let config = KernelConfig {
                tiny_work_threshold: 0,
                ..KernelConfig::default()
            };
            let kernels = KernelDispatcher::with_level(level, config).unwrap();
            let c = kernels.matmul(&a, &b, m, k, n).unwrap();
            for (got, want) in c.iter().zip(&expected) {
                assert!((got - want).abs() < 1e-4, "{level}: {got} vs {want}");
            }
        }
    }

    #[test]
    fn test_parallel_rows_match_serial() {
        let (m, k, n) = (9, 16, 24);
        let a = make_input(m * k, 3);
        let b = make_input(k * n, 4);
        let serial = KernelDispatcher::new(KernelConfig {
            parallel_row_threshold: usize::MAX,
            tiny_work_threshold: 0,
            force_level: None,
        })
        .unwrap();
        let parallel = KernelDispatcher::new(KernelConfig {
            parallel_row_threshold: 1,
            tiny_work_threshold: 0,
            force_level: None,
        })
        .unwrap();

        assert_eq!(
            serial.matmul(&a, &b, m, k, n).unwrap(),
            parallel.matmul(&a, &b, m, k, n).unwrap()
        );
    }

    #[test]
    fn test_shape_mismatch_leaves_output_untouched() {
        let kernels = KernelDispatcher::default();
        let a = vec![1.0; 4 * 4];
        let b = vec![1.0; 3 * 4];
        let mut c = vec![-1.0; 16];

        let err = kernels.matmul_into(&a, &b, 4, 4, 4, &mut c).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert!(c.iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_transposed_matches_plain() {
        let (m, k, n) = (3, 19, 11);
        let kernels = KernelDispatcher::default();
        let a = make_input(m * k, 5);
        let b = make_input(k * n, 6);
        let mut bt = vec![0.0; n * k];
        for p in 0..k {
            for j in 0..n {
                bt[j * k + p] = b[p * n + j];
            }
        }

        let plain = kernels.matmul(&a, &b, m, k, n).unwrap();
        let mut transposed = vec![0.0; m * n];
        kernels
            .matmul_transposed_into(&a, &bt, m, k, n, &mut transposed)
            .unwrap();
        for (x, y) in plain.iter().zip(&transposed) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_attention_scores() {
        let kernels = KernelDispatcher::default();
        let q = [1.0, 0.0, 2.0, 0.0];
        let keys = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.5, 0.0, -1.0, 3.0, 0.0, 3.0];

        let scores = kernels.attention_scores(&q, &keys, 4).unwrap();
        assert_eq!(scores, vec![3.0, 1.0, -1.0]);

        assert!(kernels.attention_scores(&q, &keys[..10], 4).is_err());
        assert!(kernels.attention_scores(&q[..3], &keys, 4).is_err());
    }

    #[test]
    fn test_zero_sized_dimensions() {
        let kernels = KernelDispatcher::default();
        assert!(kernels.matmul(&[], &[], 0, 3, 0).unwrap().is_empty());
        assert_eq!(kernels.matmul(&[], &[], 2, 0, 2).unwrap(), vec![0.0; 4]);
    }
}
