use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use kwip::config::{ConfigManager, KwipConfig};
use kwip::counts::{CountSource, StoreSource};
use kwip::entropy::EntropyVector;
use kwip::kernel::{Kernel, KernelEngine, Metric, WeightedInnerProduct};
use kwip::logging::{LogLevel, LoggingSystem};
use kwip::output::{MatrixKind, MatrixWriter, OutputMetadata};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// kwip: k-mer weighted inner product sample distances
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kernel metric
    #[arg(value_enum)]
    metric: Metric,

    /// Sample count files (chunked array containers with counts/N tables)
    #[arg(required = true, value_name = "SAMPLES")]
    samples: Vec<String>,

    /// Number of worker threads (0 = all cores)
    #[arg(short, long, value_name = "INT")]
    threads: Option<usize>,

    /// Bin entropy weights: loaded if FILE exists, otherwise computed and saved there (wip only)
    #[arg(short, long, value_name = "FILE")]
    weights: Option<PathBuf>,

    /// Write the kernel matrix to FILE
    #[arg(short, long, value_name = "FILE")]
    kernel: Option<PathBuf>,

    /// Write the distance matrix to FILE
    #[arg(short, long, value_name = "FILE")]
    distance: Option<PathBuf>,

    /// Normalise d2 by table totals
    #[arg(long)]
    normalize: bool,

    /// Configuration file (.toml, .yaml, .yml or .json)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn load_config(args: &Args) -> Result<ConfigManager> {
    let mut manager = match &args.config {
        Some(path) => ConfigManager::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ConfigManager::new(),
    };
    manager.load_from_env()?;

    manager.update(|config: &mut KwipConfig| {
        if let Some(threads) = args.threads {
            config.engine.num_threads = threads;
        }
        if args.normalize {
            config.engine.normalize = true;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }
        config.logging.level = match args.verbose {
            0 => config.logging.level,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        };
    })?;
    Ok(manager)
}

/// Weighted inner product kernel with its entropy vector loaded from or
/// saved to `weights`.
fn weighted_kernel(
    weights: Option<&Path>,
    source: &dyn CountSource,
    samples: &[String],
    num_threads: usize,
) -> Result<WeightedInnerProduct> {
    if let Some(path) = weights.filter(|p| p.exists()) {
        let entropy = EntropyVector::load_from_path(path)
            .with_context(|| format!("loading bin entropy weights from {}", path.display()))?;
        info!(path = %path.display(), bins = entropy.len(), "Loaded bin entropy weights");
        return Ok(WeightedInnerProduct::with_entropy(entropy));
    }

    let mut kernel = WeightedInnerProduct::new();
    let pool = KernelEngine::thread_pool(num_threads)?;
    let entropy = kernel.calculate_entropy_vector(source, samples, &pool)?;
    if let Some(path) = weights {
        entropy
            .save_to_path(path)
            .with_context(|| format!("saving bin entropy weights to {}", path.display()))?;
        info!(path = %path.display(), "Saved bin entropy weights");
    }
    Ok(kernel)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let manager = load_config(&args)?;
    let config = manager.config();
    let logging = LoggingSystem::init(config.logging.clone()).context("initialising logging")?;

    let num_threads = manager.num_threads();
    info!(
        metric = %args.metric,
        samples = args.samples.len(),
        threads = num_threads,
        "Starting kwip"
    );

    let source = StoreSource::new();
    let kernel: Box<dyn Kernel> = match args.metric {
        Metric::Wip => Box::new(weighted_kernel(
            args.weights.as_deref(),
            &source,
            &args.samples,
            num_threads,
        )?),
        metric => {
            if args.weights.is_some() {
                warn!(metric = %metric, "Ignoring --weights for an unweighted metric");
            }
            metric.build(config.engine.normalize)
        }
    };

    let mut engine = KernelEngine::new(kernel, num_threads).with_metrics(logging.metrics());
    let kernel_matrix = engine
        .calculate_pairwise(&source, &args.samples)
        .context("computing pairwise kernel matrix")?;
    if !kernel_matrix.is_symmetric() {
        bail!("kernel matrix is not symmetric");
    }
    let distance_matrix = kernel_matrix.to_distance();

    let writer = MatrixWriter::new(config.output.clone(), OutputMetadata::new(args.metric.name()));
    if let Some(path) = &args.kernel {
        let (written, _) = writer
            .write(&kernel_matrix, MatrixKind::Kernel, path)
            .with_context(|| format!("writing kernel matrix to {}", path.display()))?;
        info!(path = %written.display(), "Kernel matrix written");
    }
    if let Some(path) = &args.distance {
        let (written, _) = writer
            .write(&distance_matrix, MatrixKind::Distance, path)
            .with_context(|| format!("writing distance matrix to {}", path.display()))?;
        info!(path = %written.display(), "Distance matrix written");
    }
    if args.kernel.is_none() && args.distance.is_none() {
        writer.write_to(&distance_matrix, MatrixKind::Distance, io::stdout().lock())?;
    }

    logging.log_metrics_summary();
    Ok(())
}
