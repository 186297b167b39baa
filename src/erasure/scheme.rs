//! Coding schemes: encode k data fragments into m coding fragments and
//! rebuild any erased fragments from k survivors.
//!
//! Three methods sit behind one [`CodingScheme`]:
//! - Reed-Solomon over GF(2^8), byte oriented
//! - Cauchy Reed-Solomon bit matrices over GF(2^w)
//! - Liberation bit matrices (RAID-6, two coding fragments)
//!
//! The coding matrix and encoding schedule are built once in
//! [`CodingScheme::new`] and reused on every call.

use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::bitmatrix::BitMatrix;
use super::galois::GaloisField;
use super::schedule::{RowPlan, Schedule};
use crate::config::ErasureConfig;
use crate::error::{Error, Result};

/// Bit-matrix packets are processed in machine words
pub const PACKET_WORD_BYTES: usize = std::mem::size_of::<u64>();

/// Which code to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodingMethod {
    /// Classic Reed-Solomon, w = 8
    ReedSolomon,
    /// Cauchy Reed-Solomon, k + m <= 2^w
    Cauchy,
    /// Liberation code: m = 2, k <= w, w an odd prime
    Liberation,
}

impl Default for CodingMethod {
    fn default() -> Self {
        CodingMethod::Cauchy
    }
}

impl fmt::Display for CodingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodingMethod::ReedSolomon => write!(f, "reed_solomon"),
            CodingMethod::Cauchy => write!(f, "cauchy"),
            CodingMethod::Liberation => write!(f, "liberation"),
        }
    }
}

enum Technique {
    ReedSolomon(ReedSolomon),
    Bitmatrix {
        matrix: BitMatrix,
        schedule: Schedule,
    },
}

/// A validated erasure code with its precomputed matrix and schedule
pub struct CodingScheme {
    method: CodingMethod,
    k: usize,
    m: usize,
    w: usize,
    packet_size: usize,
    technique: Technique,
}

impl fmt::Debug for CodingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodingScheme")
            .field("method", &self.method)
            .field("k", &self.k)
            .field("m", &self.m)
            .field("w", &self.w)
            .field("packet_size", &self.packet_size)
            .finish()
    }
}

impl CodingScheme {
    /// Validate the parameters and build the scheme
    ///
    /// # Errors
    /// `CodingConfiguration` when `(method, k, m, w, packet_size)` is not a
    /// valid combination.
    pub fn new(
        method: CodingMethod,
        k: usize,
        m: usize,
        w: usize,
        packet_size: usize,
    ) -> Result<Self> {
        if k == 0 {
            return Err(invalid("k must be greater than 0"));
        }
        if m == 0 {
            return Err(invalid("m must be greater than 0"));
        }

        let technique = match method {
            CodingMethod::ReedSolomon => {
                if w != 8 {
                    return Err(invalid(format!("Reed-Solomon requires w = 8, got {}", w)));
                }
                if k + m > 256 {
                    return Err(invalid(format!(
                        "k + m ({}) must not exceed 256 for Reed-Solomon",
                        k + m
                    )));
                }
                let rs = ReedSolomon::new(k, m)
                    .map_err(|e| invalid(format!("Reed-Solomon setup failed: {:?}", e)))?;
                Technique::ReedSolomon(rs)
            }
            CodingMethod::Cauchy => {
                check_packet_size(packet_size)?;
                let field = GaloisField::new(w as u32)?;
                let matrix = BitMatrix::cauchy(k, m, &field)?;
                let schedule = Schedule::smart_encoding(&matrix, k, w);
                Technique::Bitmatrix { matrix, schedule }
            }
            CodingMethod::Liberation => {
                check_packet_size(packet_size)?;
                if m != 2 {
                    return Err(invalid(format!("Liberation requires m = 2, got {}", m)));
                }
                if w <= 2 || !is_prime(w) {
                    return Err(invalid(format!(
                        "Liberation requires w to be an odd prime greater than 2, got {}",
                        w
                    )));
                }
                if k > w {
                    return Err(invalid(format!(
                        "Liberation requires k <= w, got k = {} and w = {}",
                        k, w
                    )));
                }
                let matrix = BitMatrix::liberation(k, w);
                let schedule = Schedule::smart_encoding(&matrix, k, w);
                Technique::Bitmatrix { matrix, schedule }
            }
        };

        Ok(Self {
            method,
            k,
            m,
            w,
            packet_size,
            technique,
        })
    }

    /// Build from the `erasure` section of the configuration
    pub fn from_config(config: &ErasureConfig) -> Result<Self> {
        Self::new(
            config.method,
            config.data_fragments,
            config.coding_fragments,
            config.word_size,
            config.packet_size,
        )
    }

    pub fn method(&self) -> CodingMethod {
        self.method
    }

    /// Number of data fragments
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of coding fragments
    pub fn m(&self) -> usize {
        self.m
    }

    pub fn w(&self) -> usize {
        self.w
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Total fragments per object (k + m)
    pub fn total(&self) -> usize {
        self.k + self.m
    }

    /// Fragment sizes must be a multiple of this
    pub fn alignment(&self) -> usize {
        match self.technique {
            Technique::ReedSolomon(_) => 1,
            Technique::Bitmatrix { .. } => self.w * self.packet_size,
        }
    }

    /// Fill the last `m` fragments from the first `k`.
    ///
    /// All `k + m` fragments must have the same length, a multiple of
    /// [`alignment`](Self::alignment).
    pub fn encode(&self, fragments: &mut [Vec<u8>]) -> Result<()> {
        if fragments.len() != self.total() {
            return Err(Error::Encode(format!(
                "Expected {} fragments, got {}",
                self.total(),
                fragments.len()
            )));
        }

        let size = fragments[0].len();
        if fragments.iter().any(|f| f.len() != size) {
            return Err(Error::Encode("Fragments differ in size".to_string()));
        }
        if size % self.alignment() != 0 {
            return Err(Error::Encode(format!(
                "Fragment size {} is not a multiple of {}",
                size,
                self.alignment()
            )));
        }
        if size == 0 {
            return Ok(());
        }

        match &self.technique {
            Technique::ReedSolomon(rs) => rs
                .encode(fragments)
                .map_err(|e| Error::Encode(format!("Reed-Solomon encoding failed: {:?}", e))),
            Technique::Bitmatrix { schedule, .. } => {
                schedule.execute(fragments, self.w, self.packet_size);
                Ok(())
            }
        }
    }

    /// Rebuild every `None` entry in place.
    ///
    /// `fragments` holds `k + m` entries, data first. At most `m` may be
    /// absent.
    pub fn decode(&self, fragments: &mut [Option<Vec<u8>>]) -> Result<()> {
        if fragments.len() != self.total() {
            return Err(Error::Decode(format!(
                "Expected {} fragments, got {}",
                self.total(),
                fragments.len()
            )));
        }

        let available = fragments.iter().filter(|f| f.is_some()).count();
        if available == self.total() {
            return Ok(());
        }
        if available < self.k {
            return Err(Error::ReconstructionFailure {
                available,
                required: self.k,
            });
        }

        let size = fragments
            .iter()
            .flatten()
            .map(|f| f.len())
            .next()
            .unwrap_or(0);
        if fragments.iter().flatten().any(|f| f.len() != size) {
            return Err(Error::Decode("Surviving fragments differ in size".to_string()));
        }
        if size % self.alignment() != 0 {
            return Err(Error::Decode(format!(
                "Fragment size {} is not a multiple of {}",
                size,
                self.alignment()
            )));
        }
        if size == 0 {
            for fragment in fragments.iter_mut() {
                fragment.get_or_insert_with(Vec::new);
            }
            return Ok(());
        }

        match &self.technique {
            Technique::ReedSolomon(rs) => rs
                .reconstruct(fragments)
                .map_err(|e| Error::Decode(format!("Reed-Solomon reconstruction failed: {:?}", e))),
            Technique::Bitmatrix { matrix, .. } => self.decode_bitmatrix(matrix, fragments, size),
        }
    }

    fn decode_bitmatrix(
        &self,
        matrix: &BitMatrix,
        fragments: &mut [Option<Vec<u8>>],
        size: usize,
    ) -> Result<()> {
        let (k, w) = (self.k, self.w);
        let erased: Vec<usize> = (0..self.total())
            .filter(|&i| fragments[i].is_none())
            .collect();
        let mut buffers: Vec<Vec<u8>> = fragments
            .iter_mut()
            .map(|f| f.take().unwrap_or_else(|| vec![0u8; size]))
            .collect();

        let mut plans = Vec::new();

        if erased.iter().any(|&i| i < k) {
            // First k survivors, data preferred
            let chosen: Vec<usize> = (0..self.total())
                .filter(|i| !erased.contains(i))
                .take(k)
                .collect();

            let mut square = BitMatrix::zeros(k * w, k * w);
            for (position, &device) in chosen.iter().enumerate() {
                for r in 0..w {
                    let row = position * w + r;
                    if device < k {
                        square.set(row, device * w + r, true);
                    } else {
                        let source_row = (device - k) * w + r;
                        for col in 0..k * w {
                            square.set(row, col, matrix.get(source_row, col));
                        }
                    }
                }
            }

            let inverse = square
                .invert()
                .ok_or_else(|| Error::Decode("Decoding matrix is singular".to_string()))?;

            for &device in erased.iter().filter(|&&i| i < k) {
                for r in 0..w {
                    let sources = inverse
                        .row_ones(device * w + r)
                        .into_iter()
                        .map(|c| (chosen[c / w], c % w))
                        .collect();
                    plans.push(RowPlan {
                        dst: (device, r),
                        sources,
                    });
                }
            }
        }

        if !plans.is_empty() {
            Schedule::from_rows(&plans).execute(&mut buffers, w, self.packet_size);
            plans.clear();
        }

        // Erased coding fragments are re-encoded from the now complete data
        for &device in erased.iter().filter(|&&i| i >= k) {
            for r in 0..w {
                let sources = matrix
                    .row_ones((device - k) * w + r)
                    .into_iter()
                    .map(|c| (c / w, c % w))
                    .collect();
                plans.push(RowPlan {
                    dst: (device, r),
                    sources,
                });
            }
        }
        if !plans.is_empty() {
            Schedule::from_rows(&plans).execute(&mut buffers, w, self.packet_size);
        }

        for (slot, buffer) in fragments.iter_mut().zip(buffers) {
            *slot = Some(buffer);
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::CodingConfiguration(message.into())
}

fn check_packet_size(packet_size: usize) -> Result<()> {
    if packet_size == 0 || packet_size % PACKET_WORD_BYTES != 0 {
        return Err(invalid(format!(
            "packet size must be a positive multiple of {}, got {}",
            PACKET_WORD_BYTES, packet_size
        )));
    }
    Ok(())
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    (2..).take_while(|d| d * d <= n).all(|d| n % d != 0)
}
