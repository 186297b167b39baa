//! Arithmetic in GF(2^w)
//!
//! Elements are stored in a `u32`; multiplication is carry-less with
//! reduction by the field's primitive polynomial.

use crate::error::{Error, Result};

/// Smallest supported word size
pub const MIN_WORD_SIZE: u32 = 2;

/// Largest supported word size
pub const MAX_WORD_SIZE: u32 = 16;

/// Primitive polynomials indexed by w (including the x^w term)
const PRIMITIVE_POLYNOMIALS: [u32; 17] = [
    0, 0, 0x7, 0xb, 0x13, 0x25, 0x43, 0x89, 0x11d, 0x211, 0x409, 0x805, 0x1053, 0x201b, 0x4443,
    0x8003, 0x1100b,
];

/// A binary extension field GF(2^w)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GaloisField {
    w: u32,
    polynomial: u32,
}

impl GaloisField {
    /// Create the field for word size `w`
    pub fn new(w: u32) -> Result<Self> {
        if !(MIN_WORD_SIZE..=MAX_WORD_SIZE).contains(&w) {
            return Err(Error::CodingConfiguration(format!(
                "w must be between {} and {} for GF(2^w) arithmetic, got {}",
                MIN_WORD_SIZE, MAX_WORD_SIZE, w
            )));
        }

        Ok(Self {
            w,
            polynomial: PRIMITIVE_POLYNOMIALS[w as usize],
        })
    }

    /// Word size exponent
    pub fn w(&self) -> u32 {
        self.w
    }

    /// Number of elements in the field (2^w)
    pub fn order(&self) -> u64 {
        1u64 << self.w
    }

    /// Multiply two field elements
    pub fn mul(&self, a: u32, b: u32) -> u32 {
        let high_bit = 1u32 << self.w;
        let mut a = a;
        let mut b = b;
        let mut product = 0;

        while b != 0 {
            if b & 1 == 1 {
                product ^= a;
            }
            b >>= 1;
            a <<= 1;
            if a & high_bit != 0 {
                a ^= self.polynomial;
            }
        }

        product
    }

    /// Multiplicative inverse; zero has none
    pub fn inverse(&self, a: u32) -> Option<u32> {
        if a == 0 {
            return None;
        }

        // a^(2^w - 2) == a^-1 since the multiplicative group has order 2^w - 1
        let mut exponent = (1u64 << self.w) - 2;
        let mut base = a;
        let mut result = 1;
        while exponent > 0 {
            if exponent & 1 == 1 {
                result = self.mul(result, base);
            }
            base = self.mul(base, base);
            exponent >>= 1;
        }

        Some(result)
    }

    /// Divide `a` by `b`
    pub fn div(&self, a: u32, b: u32) -> Option<u32> {
        self.inverse(b).map(|inv| self.mul(a, inv))
    }
}
