//! Row-major quantized matrices.
//!
//! Storage matches the external tensor descriptor: packed code bytes for all
//! blocks in row-major order, plus one scale per block.

use rayon::prelude::*;

use super::{BLOCK_SIZE, QuantEncoding, check_scale, pack, quantize_block};
use crate::error::{Error, Result};
use crate::kernels::KernelDispatcher;

/// A `[rows × cols]` matrix stored as quantized blocks.
#[derive(Debug, Clone)]
pub struct QuantizedMatrix {
    encoding: QuantEncoding,
    rows: usize,
    cols: usize,
    data: Vec<u8>,
    scales: Vec<f32>,
}

impl QuantizedMatrix {
    /// Quantize a row-major `f32` matrix.
    ///
    /// # Errors
    ///
    /// * [`Error::ShapeMismatch`] if `cols` is not a multiple of the block size
    ///   or `data` is not `rows * cols` long.
    /// * [`Error::UnsupportedQuantization`] if any block contains a
    ///   non-finite value.
    pub fn quantize(data: &[f32], rows: usize, cols: usize, encoding: QuantEncoding) -> Result<Self> {
        if cols % BLOCK_SIZE != 0 {
            return Err(Error::shape(
                "quantize",
                &[rows, cols.div_ceil(BLOCK_SIZE) * BLOCK_SIZE],
                &[rows, cols],
            ));
        }
        if data.len() != rows * cols {
            return Err(Error::shape("quantize", &[rows, cols], &[data.len()]));
        }

        let bytes_per_block = encoding.bytes_per_block();
        let num_blocks = data.len() / BLOCK_SIZE;
        let mut packed = vec![0u8; num_blocks * bytes_per_block];
        let mut scales = Vec::with_capacity(num_blocks);

        for (i, (chunk, out)) in data
            .chunks_exact(BLOCK_SIZE)
            .zip(packed.chunks_exact_mut(bytes_per_block))
            .enumerate()
        {
            let mut values = [0.0f32; BLOCK_SIZE];
            values.copy_from_slice(chunk);
            let block = quantize_block(&values, encoding);
            if !block.scale().is_finite() {
                return Err(Error::UnsupportedQuantization(format!(
                    "non-finite value in block {i} (row {})",
                    i * BLOCK_SIZE / cols
                )));
            }
            pack::pack(encoding, block.codes(), out);
            scales.push(block.scale());
        }

        Ok(Self {
            encoding,
            rows,
            cols,
            data: packed,
            scales,
        })
    }

    /// Wrap raw descriptor bytes and scales.
    ///
    /// # Errors
    ///
    /// * [`Error::ShapeMismatch`] if the byte or scale counts disagree with
    ///   the shape.
    /// * [`Error::UnsupportedQuantization`] if a scale is negative or
    ///   non-finite.
    pub fn from_raw(
        encoding: QuantEncoding,
        rows: usize,
        cols: usize,
        data: Vec<u8>,
        scales: Vec<f32>,
    ) -> Result<Self> {
        if cols % BLOCK_SIZE != 0 {
            return Err(Error::shape("quantized matrix", &[rows, BLOCK_SIZE], &[rows, cols]));
        }
        let num_blocks = rows * cols / BLOCK_SIZE;
        if scales.len() != num_blocks {
            return Err(Error::shape("quantized scales", &[num_blocks], &[scales.len()]));
        }
        let expected_bytes = num_blocks * encoding.bytes_per_block();
        if data.len() != expected_bytes {
            return Err(Error::shape("quantized data", &[expected_bytes], &[data.len()]));
        }
        for &scale in &scales {
            check_scale(scale)?;
        }
        Ok(Self {
            encoding,
            rows,
            cols,
            data,
            scales,
        })
    }

    /// Dequantize one row into `out` (`cols` long).
    pub fn dequantize_row_into(&self, row: usize, out: &mut [f32]) -> Result<()> {
        if row >= self.rows {
            return Err(Error::shape("dequantize_row", &[self.rows], &[row]));
        }
        if out.len() != self.cols {
            return Err(Error::shape("dequantize_row", &[self.cols], &[out.len()]));
        }
        let blocks_per_row = self.cols / BLOCK_SIZE;
        let bytes_per_block = self.encoding.bytes_per_block();
        let first = row * blocks_per_row;
        let bytes = &self.data[first * bytes_per_block..(first + blocks_per_row) * bytes_per_block];

        let mut codes = [0i8; BLOCK_SIZE];
        for ((dst, src), &scale) in out
            .chunks_exact_mut(BLOCK_SIZE)
            .zip(bytes.chunks_exact(bytes_per_block))
            .zip(&self.scales[first..first + blocks_per_row])
        {
            pack::unpack(self.encoding, src, &mut codes);
            for (d, &c) in dst.iter_mut().zip(&codes) {
                *d = c as f32 * scale;
            }
        }
        Ok(())
    }

    /// Dequantize the whole matrix, row-major.
    pub fn dequantize(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; self.rows * self.cols];
        if self.cols == 0 {
            return Ok(out);
        }
        out.par_chunks_mut(self.cols)
            .enumerate()
            .try_for_each(|(row, dst)| self.dequantize_row_into(row, dst))?;
        Ok(out)
    }

    /// `out [m × rows] = x [m × cols] · selfᵀ`, one weight row dequantized at
    /// a time into a scratch buffer.
    pub fn matmul_transposed(
        &self,
        kernels: &KernelDispatcher,
        x: &[f32],
        m: usize,
        out: &mut [f32],
    ) -> Result<()> {
        if x.len() != m * self.cols {
            return Err(Error::shape("quantized linear input", &[m, self.cols], &[x.len()]));
        }
        if out.len() != m * self.rows {
            return Err(Error::shape("quantized linear output", &[m, self.rows], &[out.len()]));
        }
        if m == 0 || self.rows == 0 {
            return Ok(());
        }

        let mut scratch = vec![0.0f32; self.cols];
        for r in 0..self.rows {
            self.dequantize_row_into(r, &mut scratch)?;
            for (i, x_row) in x.chunks_exact(self.cols).enumerate() {
                out[i * self.rows + r] = kernels.dot(x_row, &scratch)?;
            }
        }
        Ok(())
    }

    // ========== Getters ==========

    pub fn encoding(&self) -> QuantEncoding {
        self.encoding
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Packed code bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// One scale per block, row-major.
    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// Bytes held by codes and scales.
    pub fn size_bytes(&self) -> usize {
        self.data.len() + self.scales.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rows: usize, cols: usize) -> Vec<f32> {
        (0..rows * cols)
            .map(|i| ((i * 31) % 17) as f32 * 0.25 - 2.0)
            .collect()
    }

    #[test]
    fn test_rejects_unaligned_columns() {
        let err = QuantizedMatrix::quantize(&[0.0; 40], 1, 40, QuantEncoding::Q8).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut data = sample(2, 32);
        data[40] = f32::INFINITY;
        let err = QuantizedMatrix::quantize(&data, 2, 32, QuantEncoding::Q4).unwrap_err();
        assert!(matches!(err, Error::UnsupportedQuantization(_)));
    }

    #[test]
    fn test_dequantize_within_half_scale() {
        let data = sample(3, 64);
        for encoding in [QuantEncoding::Q8, QuantEncoding::Q4] {
            let q = QuantizedMatrix::quantize(&data, 3, 64, encoding).unwrap();
            assert_eq!(q.scales().len(), 6);
            assert_eq!(q.data().len(), 6 * encoding.bytes_per_block());

            let restored = q.dequantize().unwrap();
            for (i, (r, v)) in restored.iter().zip(&data).enumerate() {
                let scale = q.scales()[i / BLOCK_SIZE];
                assert!((r - v).abs() <= scale / 2.0 + 1e-6);
            }
        }
    }

    #[test]
    fn test_from_raw_validates() {
        assert!(QuantizedMatrix::from_raw(QuantEncoding::Q8, 1, 32, vec![0; 31], vec![1.0]).is_err());
        assert!(QuantizedMatrix::from_raw(QuantEncoding::Q8, 1, 32, vec![0; 32], vec![]).is_err());
        assert!(matches!(
            QuantizedMatrix::from_raw(QuantEncoding::Q4, 1, 32, vec![0; 16], vec![f32::NAN]),
            Err(Error::UnsupportedQuantization(_))
        ));
        assert!(QuantizedMatrix::from_raw(QuantEncoding::Q4, 1, 32, vec![0x88; 16], vec![0.5]).is_ok());
    }

    #[test]
    fn test_matmul_transposed_matches_dense() {
        let kernels = KernelDispatcher::default();
        let (rows, cols, m) = (5, 64, 3);
        let w = sample(rows, cols);
        let x: Vec<f32> = (0..m * cols).map(|i| (i % 5) as f32 * 0.1).collect();

        let q = QuantizedMatrix::quantize(&w, rows, cols, QuantEncoding::Q8).unwrap();
        let dense = q.dequantize().unwrap();
        let mut expected = vec![0.0; m * rows];
        kernels
            .matmul_transposed_into(&x, &dense, m, cols, rows, &mut expected)
            .unwrap();

        let mut out = vec![0.0; m * rows];
        q.matmul_transposed(&kernels, &x, m, &mut out).unwrap();
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
