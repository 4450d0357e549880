//! Pairwise kernel engine
//!
//! Every metric implements one capability, [`Kernel::compute`], over two
//! samples' count tables. The entropy-weighted metric also needs a pre-pass
//! over the whole cohort, expressed through [`Kernel::prepare`]. The pairwise
//! driver in [`KernelEngine`] is shared by all metrics.

use crate::counts::{CountSource, CountTable, Sample};
use crate::entropy::EntropyVector;
use crate::error::{KwipError, Result};
use crate::logging::{MetricsCollector, ProgressReporter};
use crate::matrix::KernelMatrix;
use crate::popstats::PopulationStats;
use clap::ValueEnum;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Selectable kernel metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Inner product of raw counts
    D2,
    /// Inner product of presence/absence
    D2pop,
    /// Jensen-Shannon similarity of count frequencies
    Js,
    /// Entropy-weighted inner product of count frequencies
    Wip,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::D2 => "d2",
            Metric::D2pop => "d2pop",
            Metric::Js => "js",
            Metric::Wip => "wip",
        }
    }

    /// Build the kernel for this metric. `normalize` only affects `d2`.
    pub fn build(self, normalize: bool) -> Box<dyn Kernel> {
        match self {
            Metric::D2 => Box::new(D2 { normalize }),
            Metric::D2pop => Box::new(D2Pop),
            Metric::Js => Box::new(JensenShannon),
            Metric::Wip => Box::new(WeightedInnerProduct::new()),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = KwipError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "d2" => Ok(Metric::D2),
            "d2pop" => Ok(Metric::D2pop),
            "js" => Ok(Metric::Js),
            "wip" => Ok(Metric::Wip),
            other => Err(KwipError::UnknownMetric(other.to_string())),
        }
    }
}

/// A symmetric similarity between two samples' count tables.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cohort-wide pre-pass, run once before any pair is computed.
    fn prepare(&mut self, _source: &dyn CountSource, _names: &[String], _pool: &ThreadPool) -> Result<()> {
        Ok(())
    }

    /// Kernel value of one pair. Callers check dimensions first.
    fn compute(&self, a: &Sample, b: &Sample) -> Result<f64>;
}

fn frequencies(table: &CountTable) -> Option<(f64, &[u32])> {
    let total = table.total();
    if total == 0 {
        None
    } else {
        Some((total as f64, table.as_slice()))
    }
}

/// Unweighted inner product, optionally over frequencies
#[derive(Debug, Clone, Copy, Default)]
pub struct D2 {
    pub normalize: bool,
}

impl Kernel for D2 {
    fn name(&self) -> &'static str {
        "d2"
    }

    fn compute(&self, a: &Sample, b: &Sample) -> Result<f64> {
        let mut kernel = 0.0;
        for (ta, tb) in a.tables().iter().zip(b.tables()) {
            let dot: f64 = ta
                .as_slice()
                .iter()
                .zip(tb.as_slice())
                .map(|(&x, &y)| x as f64 * y as f64)
                .sum();
            if self.normalize {
                let (sum_a, sum_b) = (ta.total(), tb.total());
                if sum_a > 0 && sum_b > 0 {
                    kernel += dot / (sum_a as f64 * sum_b as f64);
                }
            } else {
                kernel += dot;
            }
        }
        Ok(kernel)
    }
}

/// Inner product of binarised counts: bins present in both samples
#[derive(Debug, Clone, Copy, Default)]
pub struct D2Pop;

impl Kernel for D2Pop {
    fn name(&self) -> &'static str {
        "d2pop"
    }

    fn compute(&self, a: &Sample, b: &Sample) -> Result<f64> {
        let shared: usize = a
            .tables()
            .iter()
            .zip(b.tables())
            .map(|(ta, tb)| {
                ta.as_slice()
                    .iter()
                    .zip(tb.as_slice())
                    .filter(|&(&x, &y)| x > 0 && y > 0)
                    .count()
            })
            .sum();
        Ok(shared as f64)
    }
}

/// `1 - JSD` per table with base-2 logs, summed over tables
#[derive(Debug, Clone, Copy, Default)]
pub struct JensenShannon;

impl JensenShannon {
    /// Jensen-Shannon divergence (bits) of two count tables' frequencies.
    pub fn divergence(sum_a: f64, a: &[u32], sum_b: f64, b: &[u32]) -> f64 {
        let mut kl_a = 0.0;
        let mut kl_b = 0.0;
        for (&x, &y) in a.iter().zip(b) {
            let pa = x as f64 / sum_a;
            let pb = y as f64 / sum_b;
            let m = 0.5 * (pa + pb);
            if pa > 0.0 {
                kl_a += pa * (pa / m).log2();
            }
            if pb > 0.0 {
                kl_b += pb * (pb / m).log2();
            }
        }
        (0.5 * kl_a + 0.5 * kl_b).clamp(0.0, 1.0)
    }
}

impl Kernel for JensenShannon {
    fn name(&self) -> &'static str {
        "js"
    }

    fn compute(&self, a: &Sample, b: &Sample) -> Result<f64> {
        let mut kernel = 0.0;
        for (ta, tb) in a.tables().iter().zip(b.tables()) {
            if let (Some((sum_a, xa)), Some((sum_b, xb))) = (frequencies(ta), frequencies(tb)) {
                kernel += 1.0 - Self::divergence(sum_a, xa, sum_b, xb);
            }
        }
        Ok(kernel)
    }
}

/// Entropy-weighted inner product of count frequencies.
///
/// The entropy vector is computed lazily by [`Kernel::prepare`] the first
/// time it is needed; a vector supplied up front (e.g. loaded from disk) is
/// reused as is.
#[derive(Debug, Clone, Default)]
pub struct WeightedInnerProduct {
    entropy: Option<Arc<EntropyVector>>,
    num_samples: usize,
    table_sums: Vec<u64>,
}

impl WeightedInnerProduct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entropy(entropy: EntropyVector) -> Self {
        Self {
            entropy: Some(Arc::new(entropy)),
            ..Self::default()
        }
    }

    pub fn entropy(&self) -> Option<&EntropyVector> {
        self.entropy.as_deref()
    }

    pub fn set_entropy(&mut self, entropy: EntropyVector) {
        self.entropy = Some(Arc::new(entropy));
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Raw count sums per table from the last aggregation
    pub fn table_sums(&self) -> &[u64] {
        &self.table_sums
    }

    /// Aggregate population counts over `names` and derive the entropy vector.
    #[instrument(skip_all, fields(samples = names.len()))]
    pub fn calculate_entropy_vector(
        &mut self,
        source: &dyn CountSource,
        names: &[String],
        pool: &ThreadPool,
    ) -> Result<&EntropyVector> {
        self.num_samples = names.len();
        let stats = PopulationStats::aggregate(source, names, pool)?;
        let entropy = EntropyVector::from_stats(&stats, self.num_samples);
        info!(
            bins = entropy.len(),
            informative_bins = entropy.informative_bins(),
            total_entropy = entropy.total(),
            "Computed bin entropy vector"
        );
        self.table_sums = stats.table_sums();
        Ok(&**self.entropy.insert(Arc::new(entropy)))
    }
}

impl Kernel for WeightedInnerProduct {
    fn name(&self) -> &'static str {
        "wip"
    }

    fn prepare(&mut self, source: &dyn CountSource, names: &[String], pool: &ThreadPool) -> Result<()> {
        if self.entropy.is_none() {
            self.calculate_entropy_vector(source, names, pool)?;
        } else {
            debug!("Reusing existing bin entropy vector");
            self.num_samples = names.len();
        }
        Ok(())
    }

    fn compute(&self, a: &Sample, b: &Sample) -> Result<f64> {
        let entropy = self
            .entropy
            .as_deref()
            .ok_or_else(|| KwipError::precondition("bin entropy vector has not been computed"))?;
        let bins: usize = a.dimensions().iter().sum();
        if entropy.len() != bins {
            return Err(KwipError::dimension_mismatch(
                "entropy vector",
                &[entropy.len()],
                a.name(),
                &a.dimensions(),
            ));
        }

        let weights = entropy.values();
        let mut kernel = 0.0;
        let mut offset = 0;
        for (ta, tb) in a.tables().iter().zip(b.tables()) {
            let table_weights = &weights[offset..offset + ta.len()];
            offset += ta.len();
            let (Some((sum_a, xa)), Some((sum_b, xb))) = (frequencies(ta), frequencies(tb)) else {
                continue;
            };
            kernel += xa
                .iter()
                .zip(xb)
                .zip(table_weights)
                .map(|((&x, &y), &w)| (x as f64 / sum_a) * (y as f64 / sum_b) * w as f64)
                .sum::<f64>();
        }
        Ok(kernel)
    }
}

/// Shared pairwise driver over any [`Kernel`]
pub struct KernelEngine {
    kernel: Box<dyn Kernel>,
    num_threads: usize,
    metrics: Arc<MetricsCollector>,
}

impl KernelEngine {
    pub fn new(kernel: Box<dyn Kernel>, num_threads: usize) -> Self {
        Self {
            kernel,
            num_threads,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    pub fn kernel_mut(&mut self) -> &mut dyn Kernel {
        self.kernel.as_mut()
    }

    /// Worker pool with `num_threads` threads, or rayon's default for 0.
    pub fn thread_pool(num_threads: usize) -> Result<ThreadPool> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("kwip-worker-{}", i));
        if num_threads > 0 {
            builder = builder.num_threads(num_threads);
        }
        Ok(builder.build()?)
    }

    fn pool(&self) -> Result<ThreadPool> {
        Self::thread_pool(self.num_threads)
    }

    /// Kernel matrix over every unordered pair of `names`.
    ///
    /// Each pair is computed once and mirrored. Any load failure or
    /// dimension mismatch aborts the whole run.
    #[instrument(skip_all, fields(kernel = self.kernel.name(), samples = names.len()))]
    pub fn calculate_pairwise(&mut self, source: &dyn CountSource, names: &[String]) -> Result<KernelMatrix> {
        let pool = self.pool()?;
        let n = names.len();
        let mut matrix = KernelMatrix::new(names.to_vec());
        if n == 0 {
            return Ok(matrix);
        }

        let metrics = Arc::clone(&self.metrics);
        metrics.set_gauge("threads", pool.current_num_threads() as f64);
        metrics.set_gauge("samples", n as f64);
        metrics.time("prepare", || self.kernel.prepare(source, names, &pool))?;

        let kernel = self.kernel.as_ref();
        let progress = ProgressReporter::new("pairwise", Some((n * (n + 1) / 2) as u64));
        let rows = metrics.time("pairwise", || -> Result<Vec<Vec<f64>>> {
            let mut rows = Vec::with_capacity(n);
            for i in 0..n {
                let a = source.load(&names[i])?;
                metrics.inc_counter("samples_loaded");
                let row = pool.install(|| {
                    (i..n)
                        .into_par_iter()
                        .map(|j| {
                            let value = if i == j {
                                kernel.compute(&a, &a)?
                            } else {
                                let b = source.load(&names[j])?;
                                a.check_dimensions(&b)?;
                                kernel.compute(&a, &b)?
                            };
                            progress.inc();
                            Ok(value)
                        })
                        .collect::<Result<Vec<f64>>>()
                })?;
                debug!(row = i, sample = %names[i], "Computed kernel row");
                rows.push(row);
            }
            Ok(rows)
        })?;

        for (i, row) in rows.into_iter().enumerate() {
            for (offset, value) in row.into_iter().enumerate() {
                matrix.set_symmetric(i, i + offset, value);
            }
        }
        metrics.inc_counter_by("pairs_computed", (n * (n + 1) / 2) as u64);
        info!(samples = n, kernel = kernel.name(), "Finished pairwise kernel matrix");
        Ok(matrix)
    }
}
