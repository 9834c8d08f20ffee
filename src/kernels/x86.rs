//! SSE, AVX, AVX2+FMA and AVX-512 kernels.
//!
//! All four share one tiling scheme and differ only in register width and in
//! whether multiply-add is fused:
//!
//! ```text
//!            j ──────────── 4·W columns ────────────►
//!          ┌─────────┬─────────┬─────────┬─────────┐
//!  c_row   │  acc0   │  acc1   │  acc2   │  acc3   │   stored once per tile
//!          └─────────┴─────────┴─────────┴─────────┘
//!               ▲ a[p] broadcast × B[p, j..j+4W], p unrolled by 4
//! ```
//!
//! The unsafe functions here are only reachable through the `MicroKernel`
//! impls at the bottom, whose statics are handed out by the dispatcher after
//! runtime feature detection.

#![allow(unsafe_code)]

use std::arch::x86_64::*;

use super::{MicroKernel, SimdLevel};

/// Generates a `gemm_row` / `dot` pair for one vector width.
macro_rules! simd_kernels {
    (
        feature: $feat:literal,
        width: $w:literal,
        zero: $zero:path,
        splat: $splat:path,
        load: $load:path,
        store: $store:path,
        madd: $madd:path,
        gemm_row: $gemm:ident,
        dot: $dot:ident $(,)?
    ) => {
        /// `c_row = a_row · B` for row-major `B [a_row.len() × c_row.len()]`.
        ///
        /// # Safety
        ///
        /// The host must support the enabled target features and
        /// `b.len() == a_row.len() * c_row.len()`.
        #[target_feature(enable = $feat)]
        unsafe fn $gemm(a_row: &[f32], b: &[f32], c_row: &mut [f32]) {
            const W: usize = $w;
            let k = a_row.len();
            let n = c_row.len();
            debug_assert_eq!(b.len(), k * n);

            unsafe {
                let a = a_row.as_ptr();
                let bp = b.as_ptr();
                let cp = c_row.as_mut_ptr();
                let mut j = 0;

                while j + 4 * W <= n {
                    let mut acc0 = $zero();
                    let mut acc1 = $zero();
                    let mut acc2 = $zero();
                    let mut acc3 = $zero();

                    let mut p = 0;
                    while p + 4 <= k {
                        for q in p..p + 4 {
                            let av = $splat(*a.add(q));
                            let row = bp.add(q * n + j);
                            acc0 = $madd(acc0, av, $load(row));
                            acc1 = $madd(acc1, av, $load(row.add(W)));
                            acc2 = $madd(acc2, av, $load(row.add(2 * W)));
                            acc3 = $madd(acc3, av, $load(row.add(3 * W)));
                        }
                        p += 4;
                    }
                    while p < k {
                        let av = $splat(*a.add(p));
                        let row = bp.add(p * n + j);
                        acc0 = $madd(acc0, av, $load(row));
                        acc1 = $madd(acc1, av, $load(row.add(W)));
                        acc2 = $madd(acc2, av, $load(row.add(2 * W)));
                        acc3 = $madd(acc3, av, $load(row.add(3 * W)));
                        p += 1;
                    }

                    $store(cp.add(j), acc0);
                    $store(cp.add(j + W), acc1);
                    $store(cp.add(j + 2 * W), acc2);
                    $store(cp.add(j + 3 * W), acc3);
                    j += 4 * W;
                }

                while j + W <= n {
                    let mut acc = $zero();
                    for p in 0..k {
                        acc = $madd(acc, $splat(*a.add(p)), $load(bp.add(p * n + j)));
                    }
                    $store(cp.add(j), acc);
                    j += W;
                }

                while j < n {
                    let mut sum = 0.0f32;
                    for p in 0..k {
                        sum += *a.add(p) * *bp.add(p * n + j);
                    }
                    *cp.add(j) = sum;
                    j += 1;
                }
            }
        }

        /// Inner product of two equal-length slices.
        ///
        /// # Safety
        ///
        /// The host must support the enabled target features and
        /// `x.len() == y.len()`.
        #[target_feature(enable = $feat)]
        unsafe fn $dot(x: &[f32], y: &[f32]) -> f32 {
            const W: usize = $w;
            debug_assert_eq!(x.len(), y.len());
            let len = x.len();

            unsafe {
                let xp = x.as_ptr();
                let yp = y.as_ptr();
                let mut acc0 = $zero();
                let mut acc1 = $zero();
                let mut acc2 = $zero();
                let mut acc3 = $zero();

                let mut i = 0;
                while i + 4 * W <= len {
                    acc0 = $madd(acc0, $load(xp.add(i)), $load(yp.add(i)));
                    acc1 = $madd(acc1, $load(xp.add(i + W)), $load(yp.add(i + W)));
                    acc2 = $madd(acc2, $load(xp.add(i + 2 * W)), $load(yp.add(i + 2 * W)));
                    acc3 = $madd(acc3, $load(xp.add(i + 3 * W)), $load(yp.add(i + 3 * W)));
                    i += 4 * W;
                }
                while i + W <= len {
                    acc0 = $madd(acc0, $load(xp.add(i)), $load(yp.add(i)));
                    i += W;
                }

                let mut lanes = [0.0f32; 4 * W];
                let lp = lanes.as_mut_ptr();
                $store(lp, acc0);
                $store(lp.add(W), acc1);
                $store(lp.add(2 * W), acc2);
                $store(lp.add(3 * W), acc3);
                let mut sum: f32 = lanes.iter().sum();

                while i < len {
                    sum += *xp.add(i) * *yp.add(i);
                    i += 1;
                }
                sum
            }
        }
    };
}

// ========== Multiply-add per width ==========

#[inline]
#[target_feature(enable = "sse2")]
fn madd_sse(acc: __m128, a: __m128, b: __m128) -> __m128 {
    unsafe { _mm_add_ps(acc, _mm_mul_ps(a, b)) }
}

#[inline]
#[target_feature(enable = "avx")]
fn madd_avx(acc: __m256, a: __m256, b: __m256) -> __m256 {
    unsafe { _mm256_add_ps(acc, _mm256_mul_ps(a, b)) }
}

#[inline]
#[target_feature(enable = "avx2,fma")]
fn madd_fma(acc: __m256, a: __m256, b: __m256) -> __m256 {
    unsafe { _mm256_fmadd_ps(a, b, acc) }
}

#[inline]
#[target_feature(enable = "avx512f")]
fn madd_avx512(acc: __m512, a: __m512, b: __m512) -> __m512 {
    unsafe { _mm512_fmadd_ps(a, b, acc) }
}

simd_kernels! {
    feature: "sse2",
    width: 4,
    zero: _mm_setzero_ps,
    splat: _mm_set1_ps,
    load: _mm_loadu_ps,
    store: _mm_storeu_ps,
    madd: madd_sse,
    gemm_row: gemm_row_sse,
    dot: dot_sse,
}

simd_kernels! {
    feature: "avx",
    width: 8,
    zero: _mm256_setzero_ps,
    splat: _mm256_set1_ps,
    load: _mm256_loadu_ps,
    store: _mm256_storeu_ps,
    madd: madd_avx,
    gemm_row: gemm_row_avx,
    dot: dot_avx,
}

simd_kernels! {
    feature: "avx2,fma",
    width: 8,
    zero: _mm256_setzero_ps,
    splat: _mm256_set1_ps,
    load: _mm256_loadu_ps,
    store: _mm256_storeu_ps,
    madd: madd_fma,
    gemm_row: gemm_row_avx2_fma,
    dot: dot_avx2_fma,
}

simd_kernels! {
    feature: "avx512f",
    width: 16,
    zero: _mm512_setzero_ps,
    splat: _mm512_set1_ps,
    load: _mm512_loadu_ps,
    store: _mm512_storeu_ps,
    madd: madd_avx512,
    gemm_row: gemm_row_avx512,
    dot: dot_avx512,
}

// ========== Kernel objects ==========

macro_rules! kernel_object {
    ($name:ident, $static:ident, $level:expr, $gemm:ident, $dot:ident, $features:literal) => {
        pub(super) struct $name(());

        pub(super) static $static: $name = $name(());

        impl MicroKernel for $name {
            fn level(&self) -> SimdLevel {
                $level
            }

            fn gemm_row(&self, a_row: &[f32], b: &[f32], c_row: &mut [f32]) {
                // SAFETY: this static is only handed out after the host
                // reported the features; the dispatcher checks lengths.
                debug_assert!($level.is_supported(), "{} not supported", $features);
                unsafe { $gemm(a_row, b, c_row) }
            }

            fn dot(&self, x: &[f32], y: &[f32]) -> f32 {
                // SAFETY: as above.
                unsafe { $dot(x, y) }
            }
        }
    };
}

kernel_object!(SseKernel, SSE, SimdLevel::Sse, gemm_row_sse, dot_sse, "sse2");
kernel_object!(AvxKernel, AVX, SimdLevel::Avx, gemm_row_avx, dot_avx, "avx");
kernel_object!(
    Avx2FmaKernel,
    AVX2_FMA,
    SimdLevel::Avx2Fma,
    gemm_row_avx2_fma,
    dot_avx2_fma,
    "avx2+fma"
);
kernel_object!(
    Avx512Kernel,
    AVX512,
    SimdLevel::Avx512,
    gemm_row_avx512,
    dot_avx512,
    "avx512f"
);

#[cfg(test)]
mod tests {
    use super::*;

    fn kernels() -> Vec<&'static dyn MicroKernel> {
        let mut out: Vec<&'static dyn MicroKernel> = Vec::new();
        if SimdLevel::Sse.is_supported() {
            out.push(&SSE);
        }
        if SimdLevel::Avx.is_supported() {
            out.push(&AVX);
        }
        if SimdLevel::Avx2Fma.is_supported() {
            out.push(&AVX2_FMA);
        }
        if SimdLevel::Avx512.is_supported() {
            out.push(&AVX512);
        }
        out
    }

    #[test]
    fn test_gemm_row_hits_every_tail() {
        // 71 columns: full 4W tiles, single-register tiles and scalar tail
        // for every width; 7 rows of K leave a remainder after the unroll.
        let k = 7;
        let n = 71;
        let a: Vec<f32> = (0..k).map(|i| i as f32 - 3.0).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 13) as f32 * 0.5).collect();
        let expected: Vec<f32> = (0..n)
            .map(|j| (0..k).map(|p| a[p] * b[p * n + j]).sum())
            .collect();

        for kernel in kernels() {
            let mut c = vec![0.0; n];
            kernel.gemm_row(&a, &b, &mut c);
            for (got, want) in c.iter().zip(&expected) {
                assert!((got - want).abs() < 1e-4, "{}", kernel.level());
            }
        }
    }

    #[test]
    fn test_dot_matches_scalar() {
        let x: Vec<f32> = (0..83).map(|i| (i as f32).sin()).collect();
        let y: Vec<f32> = (0..83).map(|i| (i as f32).cos()).collect();
        let expected: f32 = x.iter().zip(&y).map(|(a, b)| a * b).sum();

        for kernel in kernels() {
            assert!((kernel.dot(&x, &y) - expected).abs() < 1e-4);
        }
    }
}
