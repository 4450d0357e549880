//! Bin entropy vector
//!
//! Each bin is weighted by the binary Shannon entropy of its presence across
//! the cohort: bins found in every sample or in none carry no weight, bins
//! found in half of the samples carry the maximum weight of one bit.
//!
//! The vector can be saved as tagged text:
//!
//! ```text
//! KWIPENTROPY<TAB><bin count>
//! 0<TAB><entropy_0>
//! 1<TAB><entropy_1>
//! ```
//!
//! or as an `f32` array in the chunked array store.

use crate::array;
use crate::error::{KwipError, Result};
use crate::popstats::PopulationStats;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Signature tag on the first line of a saved entropy vector
pub const ENTROPY_FILE_SIG: &str = "KWIPENTROPY";

/// Binary entropy in bits of a bin present in `n` of `num_samples` samples.
pub fn binary_entropy(n: u32, num_samples: usize) -> f32 {
    let n = n as usize;
    if n == 0 || n >= num_samples {
        return 0.0;
    }
    let p = n as f64 / num_samples as f64;
    let q = 1.0 - p;
    (p * -p.log2() + q * -q.log2()) as f32
}

/// Per-bin entropy weights, concatenated over tables in table order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntropyVector {
    values: Vec<f32>,
}

impl EntropyVector {
    pub fn from_values(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Compute weights from finalized population counts.
    pub fn from_population(pop_counts: &[Vec<u32>], num_samples: usize) -> Self {
        let values = pop_counts
            .iter()
            .flat_map(|table| table.iter().map(|&n| binary_entropy(n, num_samples)))
            .collect();
        Self { values }
    }

    pub fn from_stats(stats: &PopulationStats, num_samples: usize) -> Self {
        Self::from_population(&stats.population_counts(), num_samples)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sum of all weights
    pub fn total(&self) -> f64 {
        self.values.iter().map(|&v| v as f64).sum()
    }

    /// Number of bins with nonzero weight
    pub fn informative_bins(&self) -> usize {
        self.values.iter().filter(|&&v| v > 0.0).count()
    }

    /// Write the tagged text form. Fails if the vector is empty.
    pub fn save<W: Write>(&self, writer: W) -> Result<()> {
        if self.values.is_empty() {
            return Err(KwipError::precondition(
                "there is no bin entropy vector to save",
            ));
        }

        let mut writer = BufWriter::new(writer);
        writeln!(writer, "{}\t{}", ENTROPY_FILE_SIG, self.values.len())?;
        for (i, value) in self.values.iter().enumerate() {
            writeln!(writer, "{}\t{:.8e}", i, value)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read the tagged text form. The index column is ignored.
    pub fn load<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();

        let header = lines
            .next()
            .ok_or_else(|| KwipError::format("empty bin entropy vector file"))??;
        let mut fields = header.split_whitespace();
        let sig = fields.next().unwrap_or_default();
        if sig != ENTROPY_FILE_SIG {
            return Err(KwipError::format(
                "input is not a kwip bin entropy vector",
            ));
        }
        let declared: i64 = fields
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| KwipError::format("missing bin count in entropy vector header"))?;
        if declared <= 0 {
            return Err(KwipError::format(format!(
                "invalid number of bins: {}",
                declared
            )));
        }

        let expected = declared as usize;
        // The header count is untrusted; grow past one chunk only as lines arrive.
        let mut values = Vec::with_capacity(expected.min(array::CHUNKSIZE));
        for line in lines {
            if values.len() == expected {
                break;
            }
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let index = fields.next().and_then(|f| f.parse::<usize>().ok());
            let value = fields.next().and_then(|f| f.parse::<f32>().ok());
            match (index, value) {
                (Some(_), Some(value)) => values.push(value),
                _ => {
                    return Err(KwipError::format(format!(
                        "malformed entropy line {}: '{}'",
                        values.len() + 2,
                        line
                    )));
                }
            }
        }

        if values.len() != expected {
            return Err(KwipError::format(format!(
                "expected {} bins, found {}",
                expected,
                values.len()
            )));
        }
        Ok(Self { values })
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.save(File::create(path)?)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(BufReader::new(File::open(path)?))
    }

    /// Store the vector as an `f32` array under `key`.
    pub fn save_array<P: AsRef<Path>>(&self, path: P, key: &str) -> Result<()> {
        if self.values.is_empty() {
            return Err(KwipError::precondition(
                "there is no bin entropy vector to save",
            ));
        }
        array::save(path, key, &self.values)
    }

    pub fn load_array<P: AsRef<Path>>(path: P, key: &str) -> Result<Self> {
        Ok(Self {
            values: array::read(path, key)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_entropy_bounds() {
        for num_samples in 1..40usize {
            assert_eq!(binary_entropy(0, num_samples), 0.0);
            assert_eq!(binary_entropy(num_samples as u32, num_samples), 0.0);
            for n in 1..num_samples as u32 {
                let e = binary_entropy(n, num_samples);
                assert!(e > 0.0 && e <= 1.0, "entropy {} out of range for {}/{}", e, n, num_samples);
            }
        }
        assert_eq!(binary_entropy(5, 10), 1.0);
        assert_eq!(binary_entropy(1, 4), binary_entropy(3, 4));
    }

    #[test]
    fn test_example_vector() {
        let v = EntropyVector::from_population(&[vec![2, 1, 1, 0]], 2);
        assert_eq!(v.values(), &[0.0, 1.0, 1.0, 0.0]);
        assert_eq!(v.informative_bins(), 2);
        assert_eq!(v.total(), 2.0);
    }

    #[test]
    fn test_tables_are_concatenated() {
        let v = EntropyVector::from_population(&[vec![1, 0], vec![4, 2, 1]], 4);
        assert_eq!(v.len(), 5);
        assert_eq!(v.values()[2], 0.0);
        assert_eq!(v.values()[3], 1.0);
    }

    #[test]
    fn test_text_round_trip() {
        let values: Vec<f32> = (0..1000)
            .map(|i| binary_entropy(i % 97, 97) * if i % 5 == 0 { 1e-7 } else { 1.0 })
            .collect();
        let v = EntropyVector::from_values(values);

        let mut buf = Vec::new();
        v.save(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("KWIPENTROPY\t1000\n0\t"));

        let back = EntropyVector::load(Cursor::new(buf)).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_save_empty_fails() {
        let mut buf = Vec::new();
        let result = EntropyVector::default().save(&mut buf);
        assert!(matches!(result, Err(KwipError::Precondition(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_load_rejects_bad_input() {
        let bad_sig = "NOTKWIP\t2\n0\t0.5\n1\t0.5\n";
        assert!(matches!(
            EntropyVector::load(Cursor::new(bad_sig)),
            Err(KwipError::Format(_))
        ));

        for count in ["0", "-3"] {
            let text = format!("{}\t{}\n", ENTROPY_FILE_SIG, count);
            assert!(matches!(
                EntropyVector::load(Cursor::new(text)),
                Err(KwipError::Format(_))
            ));
        }

        let short = format!("{}\t3\n0\t0.5\n1\t0.5\n", ENTROPY_FILE_SIG);
        assert!(EntropyVector::load(Cursor::new(short)).is_err());

        let huge = format!("{}\t{}\n0\t0.5\n", ENTROPY_FILE_SIG, i64::MAX);
        assert!(matches!(
            EntropyVector::load(Cursor::new(huge)),
            Err(KwipError::Format(_))
        ));

        let garbled = format!("{}\t1\n0\tabc\n", ENTROPY_FILE_SIG);
        assert!(EntropyVector::load(Cursor::new(garbled)).is_err());

        assert!(EntropyVector::load(Cursor::new("")).is_err());
    }

    #[test]
    fn test_path_and_array_round_trip() {
        let dir = TempDir::new().unwrap();
        let v = EntropyVector::from_population(&[vec![0, 1, 2, 3, 4]], 4);

        let text_path = dir.path().join("weights.txt");
        v.save_to_path(&text_path).unwrap();
        assert_eq!(EntropyVector::load_from_path(&text_path).unwrap(), v);

        let array_path = dir.path().join("weights.kwa");
        v.save_array(&array_path, "entropy").unwrap();
        assert_eq!(EntropyVector::load_array(&array_path, "entropy").unwrap(), v);
    }
}
