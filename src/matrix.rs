//! Square sample-by-sample matrices

use crate::error::{KwipError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Symmetric matrix of kernel (or distance) values indexed by sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMatrix {
    names: Vec<String>,
    values: Vec<f64>,
}

impl KernelMatrix {
    /// Zero-filled matrix over `names`.
    pub fn new(names: Vec<String>) -> Self {
        let n = names.len();
        Self {
            names,
            values: vec![0.0; n * n],
        }
    }

    /// Build from row-major values. Fails unless `values` is `n * n` long.
    pub fn from_values(names: Vec<String>, values: Vec<f64>) -> Result<Self> {
        let n = names.len();
        if values.len() != n * n {
            return Err(KwipError::precondition(format!(
                "{} values cannot fill a {}x{} matrix",
                values.len(),
                n,
                n
            )));
        }
        Ok(Self { names, values })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.len() + j]
    }

    /// Set both `(i, j)` and `(j, i)`.
    pub fn set_symmetric(&mut self, i: usize, j: usize, value: f64) {
        let n = self.len();
        self.values[i * n + j] = value;
        self.values[j * n + i] = value;
    }

    pub fn row(&self, i: usize) -> &[f64] {
        let n = self.len();
        &self.values[i * n..(i + 1) * n]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        // chunks_exact panics on 0
        self.values.chunks_exact(self.len().max(1))
    }

    pub fn is_symmetric(&self) -> bool {
        let n = self.len();
        (0..n).all(|i| (i + 1..n).all(|j| self.get(i, j) == self.get(j, i)))
    }

    /// Cosine-normalised kernel, `k_ij / sqrt(k_ii * k_jj)`.
    ///
    /// Pairs involving a sample with a zero self-kernel are 0.
    pub fn normalized(&self) -> Self {
        let n = self.len();
        let diag: Vec<f64> = (0..n).map(|i| self.get(i, i)).collect();
        let mut out = Self::new(self.names.clone());
        for i in 0..n {
            for j in i..n {
                let denom = (diag[i] * diag[j]).sqrt();
                let value = if denom > 0.0 { self.get(i, j) / denom } else { 0.0 };
                out.set_symmetric(i, j, value);
            }
        }
        out
    }

    /// Distance matrix, `sqrt(max(0, 2 - 2 * normalized_ij))`, zero diagonal.
    pub fn to_distance(&self) -> Self {
        let norm = self.normalized();
        let n = self.len();
        let mut out = Self::new(self.names.clone());
        for i in 0..n {
            for j in i + 1..n {
                let value = (2.0 - 2.0 * norm.get(i, j)).max(0.0).sqrt();
                out.set_symmetric(i, j, value);
            }
        }
        out
    }

    /// Tab-separated: a header of sample names, then one labelled row per
    /// sample with `precision` significant digits.
    pub fn write_tsv<W: Write>(&self, mut writer: W, precision: usize) -> Result<()> {
        let digits = precision.saturating_sub(1);
        for name in &self.names {
            write!(writer, "\t{}", name)?;
        }
        writeln!(writer)?;

        for (i, name) in self.names.iter().enumerate() {
            write!(writer, "{}", name)?;
            for value in self.row(i) {
                write!(writer, "\t{:.*e}", digits, value)?;
            }
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}
