//! Logging and run metrics for kwip
//!
//! Structured logging goes through `tracing`. Log lines are written to
//! stderr (stdout is reserved for matrices) or to a file, in plain or JSON
//! form. `MetricsCollector` and `ProgressReporter` give the aggregation and
//! kernel phases cheap counters, phase timings and rate-limited progress.

use crate::error::{KwipError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::{Directive, LevelFilter},
    fmt::{self as tfmt, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use uuid::Uuid;

/// Log level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = KwipError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(KwipError::config(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level
    pub level: LogLevel,
    /// Emit JSON lines instead of plain text
    pub json_format: bool,
    /// Log file directory (None for stderr)
    pub log_dir: Option<PathBuf>,
    /// Log file name inside `log_dir`
    pub log_file: String,
    /// Module-specific log levels
    pub module_levels: HashMap<String, LogLevel>,
    /// Log a metrics summary at the end of a run
    pub enable_metrics: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            json_format: false,
            log_dir: None,
            log_file: "kwip.log".to_string(),
            module_levels: HashMap::new(),
            enable_metrics: true,
        }
    }
}

/// Counters, gauges and phase timings collected during a run
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, f64>>,
    timers: RwLock<HashMap<String, Vec<Duration>>>,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter
    pub fn inc_counter(&self, name: &str) {
        self.inc_counter_by(name, 1);
    }

    /// Increment a counter by a specific value
    pub fn inc_counter_by(&self, name: &str, value: u64) {
        if let Ok(counters) = self.counters.read() {
            if let Some(counter) = counters.get(name) {
                counter.fetch_add(value, Ordering::Relaxed);
                return;
            }
        }
        if let Ok(mut counters) = self.counters.write() {
            counters
                .entry(name.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(value, Ordering::Relaxed);
        }
    }

    /// Set a gauge to its latest value
    pub fn set_gauge(&self, name: &str, value: f64) {
        if let Ok(mut gauges) = self.gauges.write() {
            gauges.insert(name.to_string(), value);
        }
    }

    pub fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().ok()?.get(name).copied()
    }

    /// Record a timing measurement
    pub fn record_time(&self, name: &str, duration: Duration) {
        if let Ok(mut timers) = self.timers.write() {
            timers.entry(name.to_string()).or_default().push(duration);
        }
    }

    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .ok()
            .and_then(|c| c.get(name).map(|v| v.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    /// Total time recorded under `name`
    pub fn total_time(&self, name: &str) -> Option<Duration> {
        let timers = self.timers.read().ok()?;
        timers.get(name).map(|t| t.iter().sum())
    }

    /// Time `f` and record the duration under `name`.
    pub fn time<T, F>(&self, name: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        self.record_time(name, elapsed);
        debug!(operation = name, duration = ?elapsed, "Operation completed");
        result
    }

    /// Snapshot for reporting
    pub fn summary(&self) -> MetricsSummary {
        let counters = self
            .counters
            .read()
            .map(|c| {
                c.iter()
                    .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                    .collect()
            })
            .unwrap_or_default();
        let gauges = self
            .gauges
            .read()
            .map(|g| g.clone())
            .unwrap_or_default();
        let timings = self
            .timers
            .read()
            .map(|t| {
                t.iter()
                    .map(|(k, v)| (k.clone(), v.iter().sum::<Duration>()))
                    .collect()
            })
            .unwrap_or_default();

        MetricsSummary {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            uptime: self.start_time.elapsed(),
            counters,
            gauges,
            timings,
        }
    }
}

/// Metrics summary for reporting
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub uptime: Duration,
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub timings: HashMap<String, Duration>,
}

/// Progress reporter for long-running phases
pub struct ProgressReporter {
    name: String,
    total: Option<u64>,
    current: AtomicU64,
    start_time: Instant,
    last_report: RwLock<Instant>,
    report_interval: Duration,
}

impl ProgressReporter {
    pub fn new(name: impl Into<String>, total: Option<u64>) -> Self {
        Self {
            name: name.into(),
            total,
            current: AtomicU64::new(0),
            start_time: Instant::now(),
            last_report: RwLock::new(Instant::now()),
            report_interval: Duration::from_secs(5),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, amount: u64) {
        self.current.fetch_add(amount, Ordering::Relaxed);
        self.maybe_report();
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Force a progress report
    pub fn report(&self) {
        let current = self.current();
        let elapsed = self.start_time.elapsed();
        let rate = current as f64 / elapsed.as_secs_f64().max(1e-9);

        match self.total {
            Some(total) if total > 0 => {
                let percentage = (current as f64 / total as f64) * 100.0;
                info!(
                    phase = %self.name,
                    current = current,
                    total = total,
                    elapsed = ?elapsed,
                    "Progress: {:.1}% ({}/{}) at {:.1}/sec",
                    percentage,
                    current,
                    total,
                    rate
                );
            }
            _ => {
                info!(
                    phase = %self.name,
                    current = current,
                    elapsed = ?elapsed,
                    "Progress: {} at {:.1}/sec",
                    current,
                    rate
                );
            }
        }

        if let Ok(mut last) = self.last_report.write() {
            *last = Instant::now();
        }
    }

    fn maybe_report(&self) {
        let due = self
            .last_report
            .read()
            .map(|last| last.elapsed() >= self.report_interval)
            .unwrap_or(false);
        if due {
            self.report();
        }
    }
}

/// Installed tracing subscriber plus the run's metrics
pub struct LoggingSystem {
    config: LoggingConfig,
    metrics: Arc<MetricsCollector>,
    _guard: WorkerGuard,
}

impl LoggingSystem {
    /// Install the global subscriber. Fails if one is already installed.
    pub fn init(config: LoggingConfig) -> Result<Self> {
        let (writer, guard) = match &config.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let appender = tracing_appender::rolling::never(dir, &config.log_file);
                tracing_appender::non_blocking(appender)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let format_layer = if config.json_format {
            tfmt::layer()
                .json()
                .with_writer(writer)
                .with_timer(ChronoUtc::rfc_3339())
                .with_current_span(true)
                .boxed()
        } else {
            tfmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(ChronoUtc::rfc_3339())
                .with_target(true)
                .boxed()
        };

        let mut env_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from(config.level).into())
            .from_env_lossy();
        for (module, level) in &config.module_levels {
            let directive: Directive = format!("{}={}", module, level)
                .parse()
                .map_err(|e| KwipError::config(format!("Invalid log directive for {}: {}", module, e)))?;
            env_filter = env_filter.add_directive(directive);
        }

        tracing_subscriber::registry()
            .with(format_layer.with_filter(env_filter))
            .try_init()
            .map_err(|e| KwipError::config(format!("Failed to initialize logging: {}", e)))?;

        debug!(config = ?config, "kwip logging initialized");

        Ok(Self {
            config,
            metrics: Arc::new(MetricsCollector::new()),
            _guard: guard,
        })
    }

    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// Log the metrics summary if enabled
    pub fn log_metrics_summary(&self) {
        if self.config.enable_metrics {
            let summary = self.metrics.summary();
            info!(metrics = ?summary, "Metrics summary");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metrics_collector() {
        let collector = MetricsCollector::new();

        collector.inc_counter("samples_loaded");
        collector.inc_counter_by("samples_loaded", 5);
        assert_eq!(collector.get_counter("samples_loaded"), 6);
        assert_eq!(collector.get_counter("missing"), 0);

        collector.record_time("kernel", Duration::from_millis(100));
        collector.record_time("kernel", Duration::from_millis(200));
        assert_eq!(collector.total_time("kernel"), Some(Duration::from_millis(300)));

        assert_eq!(collector.get_gauge("threads"), None);
        collector.set_gauge("threads", 4.0);
        collector.set_gauge("threads", 8.0);
        assert_eq!(collector.get_gauge("threads"), Some(8.0));

        let value = collector.time("aggregate", || 42);
        assert_eq!(value, 42);
        assert!(collector.total_time("aggregate").is_some());

        let summary = collector.summary();
        assert_eq!(summary.counters.get("samples_loaded"), Some(&6));
        assert!(summary.timings.contains_key("kernel"));
        assert_eq!(summary.gauges.get("threads"), Some(&8.0));
    }

    #[test]
    fn test_progress_reporter() {
        let reporter = ProgressReporter::new("pairs", Some(100));
        reporter.inc();
        reporter.inc_by(10);
        assert_eq!(reporter.current(), 11);
        reporter.report();
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_logging_config_serialization() {
        let config = LoggingConfig::default();
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: LoggingConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config.level, deserialized.level);
        assert_eq!(config.json_format, deserialized.json_format);
    }

    #[test]
    fn test_logging_system_writes_json_log_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut module_levels = HashMap::new();
        module_levels.insert("kwip".to_string(), LogLevel::Debug);
        let config = LoggingConfig {
            level: LogLevel::Warn,
            json_format: true,
            log_dir: Some(temp_dir.path().join("logs")),
            log_file: "test.log".to_string(),
            module_levels,
            ..Default::default()
        };

        // The only global subscriber installed in this test binary.
        let system = LoggingSystem::init(config.clone()).unwrap();
        assert_eq!(system.config().log_file, "test.log");
        info!(samples = 3, "entropy weights ready");

        match LoggingSystem::init(config) {
            Err(KwipError::Config(message)) => assert!(message.contains("initialize logging")),
            Err(other) => panic!("Expected Config error, got {:?}", other),
            Ok(_) => panic!("second global subscriber was accepted"),
        }

        // Dropping the system flushes the non-blocking writer.
        drop(system);
        let contents = fs::read_to_string(temp_dir.path().join("logs").join("test.log")).unwrap();
        let line = contents
            .lines()
            .find(|line| line.contains("entropy weights ready"))
            .expect("event missing from log file");
        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(event["level"], "INFO");
        assert_eq!(event["fields"]["samples"], 3);
    }
}
