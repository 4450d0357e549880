//! Population statistics aggregation
//!
//! Accumulates, across every sample of a cohort, how many samples have a
//! nonzero count in each bin and the summed raw counts of each table. Workers
//! update the shared counters with single atomic adds, one sample per worker,
//! so the totals do not depend on scheduling order.

use crate::counts::CountSource;
use crate::error::{KwipError, Result};
use crate::logging::ProgressReporter;
use rayon::ThreadPool;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info, instrument};

/// Per-bin population counts and per-table sums for one cohort.
#[derive(Debug)]
pub struct PopulationStats {
    dimensions: Vec<usize>,
    pop_counts: Vec<Vec<AtomicU32>>,
    table_sums: Vec<AtomicU64>,
    samples_seen: AtomicUsize,
}

impl PopulationStats {
    /// Zeroed counters for tables of the given sizes.
    pub fn new(dimensions: Vec<usize>) -> Self {
        let pop_counts = dimensions
            .iter()
            .map(|&size| (0..size).map(|_| AtomicU32::new(0)).collect())
            .collect();
        let table_sums = dimensions.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            dimensions,
            pop_counts,
            table_sums,
            samples_seen: AtomicUsize::new(0),
        }
    }

    /// Aggregate every sample in `names` on `pool`, one sample per work unit.
    #[instrument(skip_all, fields(samples = names.len()))]
    pub fn aggregate(source: &dyn CountSource, names: &[String], pool: &ThreadPool) -> Result<Self> {
        let first = names
            .first()
            .ok_or_else(|| KwipError::precondition("no samples to aggregate"))?;
        let stats = Self::new(source.dimensions(first)?);
        let progress = ProgressReporter::new("aggregate", Some(names.len() as u64));

        pool.install(|| {
            names.par_iter().try_for_each(|name| {
                stats.add_sample(source, name)?;
                info!(sample = %name, "Loaded sample");
                progress.inc();
                Ok::<(), KwipError>(())
            })
        })?;

        info!(
            samples = stats.samples_seen(),
            fpr = stats.false_positive_rate(names.len()),
            "Finished loading samples"
        );
        Ok(stats)
    }

    /// Fold one sample into the counters. Safe to call from many threads.
    pub fn add_sample(&self, source: &dyn CountSource, name: &str) -> Result<()> {
        let dims = source.dimensions(name)?;
        if dims != self.dimensions {
            return Err(KwipError::dimension_mismatch(
                "population",
                &self.dimensions,
                name,
                &dims,
            ));
        }

        for table in 0..self.pop_counts.len() {
            let mut tab_count = 0u64;
            let mut scanned = 0usize;
            source.scan_table(name, table, &mut |offset, block| {
                tab_count += self.add_block(table, offset, block)?;
                scanned += block.len();
                Ok(())
            })?;
            if scanned != self.dimensions[table] {
                return Err(KwipError::format(format!(
                    "sample '{}' table {} yielded {} bins, expected {}",
                    name, table, scanned, self.dimensions[table]
                )));
            }
            self.table_sums[table].fetch_add(tab_count, Ordering::Relaxed);
        }

        self.samples_seen.fetch_add(1, Ordering::Relaxed);
        debug!(sample = name, "Added sample to population counts");
        Ok(())
    }

    /// Count nonzero bins of one block and return the block's raw sum.
    fn add_block(&self, table: usize, offset: usize, block: &[u32]) -> Result<u64> {
        let counts = &self.pop_counts[table];
        let end = offset + block.len();
        if end > counts.len() {
            return Err(KwipError::format(format!(
                "block {}..{} exceeds table {} of {} bins",
                offset,
                end,
                table,
                counts.len()
            )));
        }

        let mut sum = 0u64;
        for (slot, &count) in counts[offset..end].iter().zip(block) {
            if count > 0 {
                slot.fetch_add(1, Ordering::Relaxed);
            }
            sum += count as u64;
        }
        Ok(sum)
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }

    /// Total bins across all tables
    pub fn total_bins(&self) -> usize {
        self.dimensions.iter().sum()
    }

    pub fn samples_seen(&self) -> usize {
        self.samples_seen.load(Ordering::Relaxed)
    }

    pub fn population_count(&self, table: usize, bin: usize) -> u32 {
        self.pop_counts[table][bin].load(Ordering::Relaxed)
    }

    /// Snapshot of the population counts, one vector per table
    pub fn population_counts(&self) -> Vec<Vec<u32>> {
        self.pop_counts
            .iter()
            .map(|table| table.iter().map(|c| c.load(Ordering::Relaxed)).collect())
            .collect()
    }

    /// Snapshot of the per-table raw count sums
    pub fn table_sums(&self) -> Vec<u64> {
        self.table_sums
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect()
    }

    /// Diagnostic false positive rate of the counting tables.
    ///
    /// Treats the mean per-sample sum of each table as insertions into that
    /// table's bins and multiplies the expected occupancies across tables.
    pub fn false_positive_rate(&self, num_samples: usize) -> f64 {
        if num_samples == 0 {
            return 0.0;
        }
        let occupancies: Vec<f64> = self
            .dimensions
            .iter()
            .zip(&self.table_sums)
            .filter(|&(&size, _)| size > 0)
            .map(|(&size, sum)| {
                let per_sample = sum.load(Ordering::Relaxed) as f64 / num_samples as f64;
                1.0 - (-per_sample / size as f64).exp()
            })
            .collect();
        if occupancies.is_empty() {
            0.0
        } else {
            occupancies.iter().product()
        }
    }
}
