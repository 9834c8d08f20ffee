//! Portable fallback kernels.

use super::{MicroKernel, SimdLevel};

pub(super) struct ScalarKernel(());

pub(super) static SCALAR: ScalarKernel = ScalarKernel(());

/// Output columns accumulated together per pass over K.
const TILE: usize = 4;

/// Rows of B consumed per step of the inner loop.
const K_UNROLL: usize = 4;

#[inline(always)]
fn accumulate(acc: &mut [f32; TILE], a: f32, b_row: &[f32]) {
    for (slot, &bv) in acc.iter_mut().zip(b_row) {
        *slot += a * bv;
    }
}

impl MicroKernel for ScalarKernel {
    fn level(&self) -> SimdLevel {
        SimdLevel::Scalar
    }

    fn gemm_row(&self, a_row: &[f32], b: &[f32], c_row: &mut [f32]) {
        let k = a_row.len();
        let n = c_row.len();
        debug_assert_eq!(b.len(), k * n);

        let mut j = 0;
        while j + TILE <= n {
            let mut acc = [0.0f32; TILE];
            let mut p = 0;
            while p + K_UNROLL <= k {
                for q in p..p + K_UNROLL {
                    accumulate(&mut acc, a_row[q], &b[q * n + j..q * n + j + TILE]);
                }
                p += K_UNROLL;
            }
            while p < k {
                accumulate(&mut acc, a_row[p], &b[p * n + j..p * n + j + TILE]);
                p += 1;
            }
            c_row[j..j + TILE].copy_from_slice(&acc);
            j += TILE;
        }
        for (jj, out) in c_row.iter_mut().enumerate().skip(j) {
            *out = a_row
                .iter()
                .enumerate()
                .map(|(p, &a)| a * b[p * n + jj])
                .sum();
        }
    }

    fn dot(&self, x: &[f32], y: &[f32]) -> f32 {
        debug_assert_eq!(x.len(), y.len());
        let mut acc = [0.0f32; 4];
        let xs = x.chunks_exact(4);
        let ys = y.chunks_exact(4);
        let tail: f32 = xs
            .remainder()
            .iter()
            .zip(ys.remainder())
            .map(|(a, b)| a * b)
            .sum();
        for (xc, yc) in xs.zip(ys) {
            for ((slot, a), b) in acc.iter_mut().zip(xc).zip(yc) {
                *slot += a * b;
            }
        }
        (acc[0] + acc[1]) + (acc[2] + acc[3]) + tail
    }
}

/// Straight triple loop for products too small to amortize tiling.
pub(super) fn gemm_direct(a: &[f32], b: &[f32], m: usize, k: usize, n: usize, c: &mut [f32]) {
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        let c_row = &mut c[i * n..(i + 1) * n];
        c_row.fill(0.0);
        for (p, &av) in a_row.iter().enumerate() {
            let b_row = &b[p * n..(p + 1) * n];
            for (out, &bv) in c_row.iter_mut().zip(b_row) {
                *out += av * bv;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_gemm_row_with_column_tail() {
        // [1 2] · [[1 2 3 4 5] [6 7 8 9 10]]
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let mut c = [0.0; 5];
        SCALAR.gemm_row(&a, &b, &mut c);
        assert_eq!(c, [13.0, 16.0, 19.0, 22.0, 25.0]);
    }

    #[test]
    fn test_scalar_gemm_row_unrolls_k_with_remainder() {
        // K = 6 runs one unrolled step and two leftover rows of B
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b: Vec<f32> = (0..6 * 5).map(|i| (i % 7) as f32 - 3.0).collect();
        let mut c = [0.0; 5];
        SCALAR.gemm_row(&a, &b, &mut c);

        let mut expected = [0.0; 5];
        gemm_direct(&a, &b, 1, 6, 5, &mut expected);
        assert_eq!(c, expected);
    }

    #[test]
    fn test_scalar_dot_with_remainder() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let y = [1.0; 6];
        assert_eq!(SCALAR.dot(&x, &y), 21.0);
    }

    #[test]
    fn test_gemm_direct() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [f32::NAN; 4];
        gemm_direct(&a, &b, 2, 2, 2, &mut c);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
    }
}
