//! Bit layout of packed codes.
//!
//! Q8 stores each code as one two's-complement byte. Q4 stores two codes per
//! byte, offset by +8 so each nibble is unsigned:
//!
//! ```text
//! byte i = (code[2i+1] + 8) << 4 | (code[2i] + 8)
//!           └── high nibble: odd ┘   └ low nibble: even ┘
//! ```

use super::QuantEncoding;

const Q4_OFFSET: i8 = 8;

/// Pack `codes` into `out`. `out` must be exactly the packed length.
pub fn pack(encoding: QuantEncoding, codes: &[i8], out: &mut [u8]) {
    match encoding {
        QuantEncoding::Q8 => {
            debug_assert_eq!(codes.len(), out.len());
            for (o, &c) in out.iter_mut().zip(codes) {
                *o = c as u8;
            }
        }
        QuantEncoding::Q4 => {
            debug_assert_eq!(codes.len(), out.len() * 2);
            for (o, pair) in out.iter_mut().zip(codes.chunks_exact(2)) {
                let even = ((pair[0] + Q4_OFFSET) as u8) & 0x0F;
                let odd = ((pair[1] + Q4_OFFSET) as u8) & 0x0F;
                *o = (odd << 4) | even;
            }
        }
    }
}

/// Unpack `bytes` into `codes`. `codes` must be exactly the unpacked length.
pub fn unpack(encoding: QuantEncoding, bytes: &[u8], codes: &mut [i8]) {
    match encoding {
        QuantEncoding::Q8 => {
            debug_assert_eq!(codes.len(), bytes.len());
            for (c, &b) in codes.iter_mut().zip(bytes) {
                *c = b as i8;
            }
        }
        QuantEncoding::Q4 => {
            debug_assert_eq!(codes.len(), bytes.len() * 2);
            for (pair, &b) in codes.chunks_exact_mut(2).zip(bytes) {
                pair[0] = (b & 0x0F) as i8 - Q4_OFFSET;
                pair[1] = (b >> 4) as i8 - Q4_OFFSET;
            }
        }
    }
}

/// Packed byte length for `elements` codes.
pub fn packed_len(encoding: QuantEncoding, elements: usize) -> usize {
    match encoding {
        QuantEncoding::Q8 => elements,
        QuantEncoding::Q4 => elements.div_ceil(2),
    }
}
