//! NEON kernels, same tiling as the x86 variants with 128-bit registers.

#![allow(unsafe_code)]

use std::arch::aarch64::*;

use super::{MicroKernel, SimdLevel};

const W: usize = 4;

/// # Safety
///
/// The host must support NEON and `b.len() == a_row.len() * c_row.len()`.
#[target_feature(enable = "neon")]
unsafe fn gemm_row_neon(a_row: &[f32], b: &[f32], c_row: &mut [f32]) {
    let k = a_row.len();
    let n = c_row.len();
    debug_assert_eq!(b.len(), k * n);

    unsafe {
        let a = a_row.as_ptr();
        let bp = b.as_ptr();
        let cp = c_row.as_mut_ptr();
        let mut j = 0;

        while j + 4 * W <= n {
            let mut acc0 = vdupq_n_f32(0.0);
            let mut acc1 = vdupq_n_f32(0.0);
            let mut acc2 = vdupq_n_f32(0.0);
            let mut acc3 = vdupq_n_f32(0.0);

            let mut p = 0;
            while p + 4 <= k {
                for q in p..p + 4 {
                    let av = vdupq_n_f32(*a.add(q));
                    let row = bp.add(q * n + j);
                    acc0 = vfmaq_f32(acc0, av, vld1q_f32(row));
                    acc1 = vfmaq_f32(acc1, av, vld1q_f32(row.add(W)));
                    acc2 = vfmaq_f32(acc2, av, vld1q_f32(row.add(2 * W)));
                    acc3 = vfmaq_f32(acc3, av, vld1q_f32(row.add(3 * W)));
                }
                p += 4;
            }
            while p < k {
                let av = vdupq_n_f32(*a.add(p));
                let row = bp.add(p * n + j);
                acc0 = vfmaq_f32(acc0, av, vld1q_f32(row));
                acc1 = vfmaq_f32(acc1, av, vld1q_f32(row.add(W)));
                acc2 = vfmaq_f32(acc2, av, vld1q_f32(row.add(2 * W)));
                acc3 = vfmaq_f32(acc3, av, vld1q_f32(row.add(3 * W)));
                p += 1;
            }

            vst1q_f32(cp.add(j), acc0);
            vst1q_f32(cp.add(j + W), acc1);
            vst1q_f32(cp.add(j + 2 * W), acc2);
            vst1q_f32(cp.add(j + 3 * W), acc3);
            j += 4 * W;
        }

        while j + W <= n {
            let mut acc = vdupq_n_f32(0.0);
            for p in 0..k {
                acc = vfmaq_f32(acc, vdupq_n_f32(*a.add(p)), vld1q_f32(bp.add(p * n + j)));
            }
            vst1q_f32(cp.add(j), acc);
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

/// # Safety
///
/// The host must support NEON and `x.len() == y.len()`.
#[target_feature(enable = "neon")]
unsafe fn dot_neon(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    let len = x.len();

    unsafe {
        let xp = x.as_ptr();
        let yp = y.as_ptr();
        let mut acc0 = vdupq_n_f32(0.0);
        let mut acc1 = vdupq_n_f32(0.0);
        let mut acc2 = vdupq_n_f32(0.0);
        let mut acc3 = vdupq_n_f32(0.0);

        let mut i = 0;
        while i + 4 * W <= len {
            acc0 = vfmaq_f32(acc0, vld1q_f32(xp.add(i)), vld1q_f32(yp.add(i)));
            acc1 = vfmaq_f32(acc1, vld1q_f32(xp.add(i + W)), vld1q_f32(yp.add(i + W)));
            acc2 = vfmaq_f32(acc2, vld1q_f32(xp.add(i + 2 * W)), vld1q_f32(yp.add(i + 2 * W)));
            acc3 = vfmaq_f32(acc3, vld1q_f32(xp.add(i + 3 * W)), vld1q_f32(yp.add(i + 3 * W)));
            i += 4 * W;
        }
        while i + W <= len {
            acc0 = vfmaq_f32(acc0, vld1q_f32(xp.add(i)), vld1q_f32(yp.add(i)));
            i += W;
        }

        let mut sum = vaddvq_f32(vaddq_f32(vaddq_f32(acc0, acc1), vaddq_f32(acc2, acc3)));
        while i < len {
            sum += *xp.add(i) * *yp.add(i);
            i += 1;
        }
        sum
    }
}

pub(super) struct NeonKernel(());

pub(super) static NEON: NeonKernel = NeonKernel(());

impl MicroKernel for NeonKernel {
    fn level(&self) -> SimdLevel {
        SimdLevel::Neon
    }

    fn gemm_row(&self, a_row: &[f32], b: &[f32], c_row: &mut [f32]) {
        // SAFETY: handed out only after NEON detection; lengths checked by
        // the dispatcher.
        unsafe { gemm_row_neon(a_row, b, c_row) }
    }

    fn dot(&self, x: &[f32], y: &[f32]) -> f32 {
        // SAFETY: as above.
        unsafe { dot_neon(x, y) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neon_gemm_row_and_dot() {
        if !SimdLevel::Neon.is_supported() {
            return;
        }
        let k = 5;
        let n = 23;
        let a: Vec<f32> = (0..k).map(|i| i as f32 + 1.0).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 7) as f32).collect();
        let mut c = vec![0.0; n];
        NEON.gemm_row(&a, &b, &mut c);
        for (j, got) in c.iter().enumerate() {
            let want: f32 = (0..k).map(|p| a[p] * b[p * n + j]).sum();
            assert!((got - want).abs() < 1e-4);
        }

        let x: Vec<f32> = (0..37).map(|i| i as f32 * 0.1).collect();
        let expected: f32 = x.iter().map(|v| v * v).sum();
        assert!((NEON.dot(&x, &x) - expected).abs() < 1e-3);
    }
}
