//! Bit matrices over GF(2)
//!
//! A coding bit matrix has `m * w` rows and `k * w` columns. Row `i * w + r`
//! describes packet `r` of coding fragment `i` as the XOR of the data packets
//! whose columns are set.

use super::galois::GaloisField;
use crate::error::{Error, Result};

/// Dense row-major matrix of bits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMatrix {
    rows: usize,
    cols: usize,
    bits: Vec<bool>,
}

impl BitMatrix {
    /// All-zero matrix
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            bits: vec![false; rows * cols],
        }
    }

    /// Square identity matrix
    pub fn identity(size: usize) -> Self {
        let mut matrix = Self::zeros(size, size);
        for i in 0..size {
            matrix.set(i, i, true);
        }
        matrix
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        self.bits[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: bool) {
        self.bits[row * self.cols + col] = value;
    }

    /// Borrow one row
    pub fn row(&self, row: usize) -> &[bool] {
        &self.bits[row * self.cols..(row + 1) * self.cols]
    }

    /// Number of set bits in a row
    pub fn row_weight(&self, row: usize) -> usize {
        self.row(row).iter().filter(|b| **b).count()
    }

    /// Column indices of the set bits in a row
    pub fn row_ones(&self, row: usize) -> Vec<usize> {
        self.row(row)
            .iter()
            .enumerate()
            .filter_map(|(col, bit)| bit.then_some(col))
            .collect()
    }

    /// Expand a `rows x cols` matrix of GF(2^w) elements into its
    /// `rows*w x cols*w` bit matrix representation.
    ///
    /// Column `x` of the `w x w` block for element `e` holds the bits of
    /// `e * 2^x`.
    pub fn from_field_matrix(field: &GaloisField, matrix: &[Vec<u32>]) -> Self {
        let w = field.w() as usize;
        let rows = matrix.len();
        let cols = matrix.first().map(|r| r.len()).unwrap_or(0);
        let mut bits = Self::zeros(rows * w, cols * w);

        for (i, row) in matrix.iter().enumerate() {
            for (j, &element) in row.iter().enumerate() {
                let mut value = element;
                for x in 0..w {
                    for l in 0..w {
                        bits.set(i * w + l, j * w + x, (value >> l) & 1 == 1);
                    }
                    value = field.mul(value, 2);
                }
            }
        }

        bits
    }

    /// Cauchy coding bit matrix for `k` data and `m` coding fragments.
    ///
    /// Element `(i, j)` is `1 / (i ^ (m + j))`, which needs `k + m <= 2^w`.
    pub fn cauchy(k: usize, m: usize, field: &GaloisField) -> Result<Self> {
        if (k + m) as u64 > field.order() {
            return Err(Error::CodingConfiguration(format!(
                "k + m ({}) must not exceed 2^w ({}) for Cauchy coding",
                k + m,
                field.order()
            )));
        }

        let mut matrix = Vec::with_capacity(m);
        for i in 0..m {
            let mut row = Vec::with_capacity(k);
            for j in 0..k {
                let denominator = (i ^ (m + j)) as u32;
                let element = field.div(1, denominator).ok_or_else(|| {
                    Error::CodingConfiguration("Cauchy matrix has a zero denominator".to_string())
                })?;
                row.push(element);
            }
            matrix.push(row);
        }

        Ok(Self::from_field_matrix(field, &matrix))
    }

    /// Liberation coding bit matrix (RAID-6: always two coding fragments).
    ///
    /// The first coding fragment is plain parity. The second uses, for data
    /// fragment `j`, the identity cyclically shifted by `j` plus one extra bit
    /// at row `y = j(w-1)/2 mod w`, column `(y + j - 1) mod w`.
    pub fn liberation(k: usize, w: usize) -> Self {
        let mut matrix = Self::zeros(2 * w, k * w);

        for i in 0..w {
            for j in 0..k {
                matrix.set(i, j * w + i, true);
            }
        }

        for j in 0..k {
            for i in 0..w {
                matrix.set(w + i, j * w + (j + i) % w, true);
            }
            if j > 0 {
                let y = (j * ((w - 1) / 2)) % w;
                matrix.set(w + y, j * w + (y + j - 1) % w, true);
            }
        }

        matrix
    }

    /// Invert a square matrix with Gauss-Jordan elimination.
    ///
    /// Returns `None` when the matrix is singular.
    pub fn invert(&self) -> Option<Self> {
        if self.rows != self.cols {
            return None;
        }

        let n = self.rows;
        let mut work = self.clone();
        let mut inverse = Self::identity(n);

        for col in 0..n {
            let pivot = (col..n).find(|&row| work.get(row, col))?;
            if pivot != col {
                work.swap_rows(pivot, col);
                inverse.swap_rows(pivot, col);
            }

            for row in 0..n {
                if row != col && work.get(row, col) {
                    work.xor_row_into(col, row);
                    inverse.xor_row_into(col, row);
                }
            }
        }

        Some(inverse)
    }

    /// Matrix product over GF(2)
    pub fn multiply(&self, other: &BitMatrix) -> Option<Self> {
        if self.cols != other.rows {
            return None;
        }

        let mut product = Self::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for k in self.row_ones(i) {
                for j in 0..other.cols {
                    if other.get(k, j) {
                        let current = product.get(i, j);
                        product.set(i, j, !current);
                    }
                }
            }
        }

        Some(product)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        for col in 0..self.cols {
            self.bits.swap(a * self.cols + col, b * self.cols + col);
        }
    }

    /// row[dst] ^= row[src]
    fn xor_row_into(&mut self, src: usize, dst: usize) {
        for col in 0..self.cols {
            if self.bits[src * self.cols + col] {
                let idx = dst * self.cols + col;
                self.bits[idx] = !self.bits[idx];
            }
        }
    }
}
