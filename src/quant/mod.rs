//! Block quantization codec.
//!
//! Weights are split into blocks of [`BLOCK_SIZE`] consecutive elements that
//! share one `f32` scale:
//!
//! ```text
//! scale = max|x| / max_code          (0 for an all-zero block)
//! code  = clamp(round(x / scale))    (signed, per encoding)
//! x'    = code × scale               |x' - x| ≤ scale / 2
//! ```
//!
//! | Encoding | Code range | Bytes per block |
//! |----------|------------|-----------------|
//! | Q8       | -128..=127 | 32              |
//! | Q4       | -8..=7     | 16 (two codes per byte) |

pub mod matrix;
pub mod pack;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use matrix::QuantizedMatrix;

/// Elements per quantization block.
pub const BLOCK_SIZE: usize = 32;

/// Supported block encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantEncoding {
    /// 8-bit signed codes.
    Q8,
    /// 4-bit signed codes, packed two per byte.
    Q4,
}

impl QuantEncoding {
    /// Largest positive code; `max|x|` maps onto it.
    pub fn max_code(&self) -> i8 {
        match self {
            Self::Q8 => 127,
            Self::Q4 => 7,
        }
    }

    /// Smallest representable code.
    pub fn min_code(&self) -> i8 {
        match self {
            Self::Q8 => -128,
            Self::Q4 => -8,
        }
    }

    /// Packed code bytes per block.
    pub fn bytes_per_block(&self) -> usize {
        match self {
            Self::Q8 => BLOCK_SIZE,
            Self::Q4 => BLOCK_SIZE / 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Q8 => "q8",
            Self::Q4 => "q4",
        }
    }
}

/// Thirty-two quantized elements and their shared scale.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedBlock {
    encoding: QuantEncoding,
    scale: f32,
    codes: [i8; BLOCK_SIZE],
}

/// Quantize one block.
///
/// Non-finite input is not hidden: the scale becomes NaN or infinite and
/// [`QuantizedBlock::dequantize`] rejects the block.
pub fn quantize_block(values: &[f32; BLOCK_SIZE], encoding: QuantEncoding) -> QuantizedBlock {
    let amax = abs_max(values);
    let scale = block_scale(amax, encoding.max_code() as f32);

    let mut codes = [0i8; BLOCK_SIZE];
    if scale.is_finite() && scale > 0.0 {
        let (lo, hi) = (encoding.min_code() as f32, encoding.max_code() as f32);
        for (code, &v) in codes.iter_mut().zip(values) {
            *code = (v / scale).round().clamp(lo, hi) as i8;
        }
    }

    QuantizedBlock {
        encoding,
        scale,
        codes,
    }
}

/// Scale for a block whose largest magnitude is `amax`.
///
/// `amax / max_code` loses precision for subnormal blocks, so the result is
/// nudged until `amax` lands within half a step of the top code and the top
/// code still decodes to a finite value.
fn block_scale(amax: f32, max_code: f32) -> f32 {
    if amax == 0.0 {
        return 0.0;
    }
    if !amax.is_finite() {
        return amax;
    }

    let mut scale = (amax / max_code).max(f32::from_bits(1));
    while amax / scale > max_code + 0.5 {
        scale = scale.next_up();
    }
    while !(scale * max_code).is_finite() {
        scale = scale.next_down();
    }
    scale
}

/// Largest magnitude in the block; NaN if any element is NaN.
fn abs_max(values: &[f32]) -> f32 {
    let mut amax = 0.0f32;
    for v in values {
        let a = v.abs();
        if a.is_nan() {
            return f32::NAN;
        }
        if a > amax {
            amax = a;
        }
    }
    amax
}

/// Scale values a decoder is willing to accept.
pub(crate) fn check_scale(scale: f32) -> Result<()> {
    if !scale.is_finite() || scale < 0.0 {
        return Err(Error::UnsupportedQuantization(format!(
            "invalid block scale {scale}"
        )));
    }
    Ok(())
}

impl QuantizedBlock {
    /// Rebuild a block from stored parts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedQuantization`] if the scale is not a
    /// non-negative finite number or a code is outside the encoding's range.
    pub fn from_parts(encoding: QuantEncoding, scale: f32, codes: [i8; BLOCK_SIZE]) -> Result<Self> {
        check_scale(scale)?;
        if let Some(bad) = codes
            .iter()
            .find(|&&c| c < encoding.min_code() || c > encoding.max_code())
        {
            return Err(Error::UnsupportedQuantization(format!(
                "code {bad} out of range for {}",
                encoding.as_str()
            )));
        }
        Ok(Self {
            encoding,
            scale,
            codes,
        })
    }

    /// Decode a block from its packed bytes.
    pub fn from_bytes(encoding: QuantEncoding, scale: f32, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != encoding.bytes_per_block() {
            return Err(Error::shape(
                "quantized block",
                &[encoding.bytes_per_block()],
                &[bytes.len()],
            ));
        }
        let mut codes = [0i8; BLOCK_SIZE];
        pack::unpack(encoding, bytes, &mut codes);
        Self::from_parts(encoding, scale, codes)
    }

    /// Packed code bytes in storage order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.encoding.bytes_per_block()];
        pack::pack(self.encoding, &self.codes, &mut out);
        out
    }

    /// `codes × scale`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedQuantization`] for a non-finite or negative
    /// scale.
    pub fn dequantize(&self) -> Result<[f32; BLOCK_SIZE]> {
        check_scale(self.scale)?;
        let mut out = [0.0f32; BLOCK_SIZE];
        for (o, &c) in out.iter_mut().zip(&self.codes) {
            *o = c as f32 * self.scale;
        }
        Ok(out)
    }

    // ========== Getters ==========

    pub fn encoding(&self) -> QuantEncoding {
        self.encoding
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn codes(&self) -> &[i8; BLOCK_SIZE] {
        &self.codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with(first: f32, rest: f32) -> [f32; BLOCK_SIZE] {
        let mut values = [rest; BLOCK_SIZE];
        values[0] = first;
        values
    }

    #[test]
    fn test_q8_scale_from_max_magnitude() {
        let mut values = [0.0f32; BLOCK_SIZE];
        for (i, v) in values.iter_mut().enumerate() {
            *v = (i as f32 / 31.0) * 8.0 - 4.0;
        }
        let block = quantize_block(&values, QuantEncoding::Q8);

        assert!((block.scale() - 4.0 / 127.0).abs() < 1e-6);
        assert_eq!(block.codes()[0], -127);
        assert_eq!(block.codes()[31], 127);

        let restored = block.dequantize().unwrap();
        for (r, v) in restored.iter().zip(&values) {
            assert!((r - v).abs() <= block.scale() / 2.0 + 1e-6);
        }
    }

    #[test]
    fn test_zero_block_round_trips_exactly() {
        for encoding in [QuantEncoding::Q8, QuantEncoding::Q4] {
            let block = quantize_block(&[0.0; BLOCK_SIZE], encoding);
            assert_eq!(block.scale(), 0.0);
            assert!(block.codes().iter().all(|&c| c == 0));
            assert_eq!(block.dequantize().unwrap(), [0.0; BLOCK_SIZE]);
        }
    }

    #[test]
    fn test_q4_codes_stay_in_range() {
        let block = quantize_block(&block_with(-3.5, 1.2), QuantEncoding::Q4);
        assert!((block.scale() - 0.5).abs() < 1e-6);
        assert_eq!(block.codes()[0], -7);
        assert!(block.codes().iter().all(|&c| (-8..=7).contains(&c)));
    }

    #[test]
    fn test_nan_input_is_rejected_on_decode() {
        let block = quantize_block(&block_with(f32::NAN, 1.0), QuantEncoding::Q8);
        assert!(block.scale().is_nan());
        assert!(matches!(
            block.dequantize(),
            Err(Error::UnsupportedQuantization(_))
        ));
    }

    #[test]
    fn test_from_parts_validation() {
        assert!(QuantizedBlock::from_parts(QuantEncoding::Q8, -1.0, [0; BLOCK_SIZE]).is_err());
        assert!(QuantizedBlock::from_parts(QuantEncoding::Q8, f32::INFINITY, [0; BLOCK_SIZE]).is_err());
        assert!(QuantizedBlock::from_parts(QuantEncoding::Q4, 1.0, [9; BLOCK_SIZE]).is_err());
        assert!(QuantizedBlock::from_parts(QuantEncoding::Q4, 1.0, [-8; BLOCK_SIZE]).is_ok());
    }

    #[test]
    fn test_bytes_round_trip() {
        let values: [f32; BLOCK_SIZE] = std::array::from_fn(|i| i as f32 - 16.0);
        for encoding in [QuantEncoding::Q8, QuantEncoding::Q4] {
            let block = quantize_block(&values, encoding);
            let bytes = block.to_bytes();
            assert_eq!(bytes.len(), encoding.bytes_per_block());
            let decoded = QuantizedBlock::from_bytes(encoding, block.scale(), &bytes).unwrap();
            assert_eq!(decoded, block);
        }
    }
}
