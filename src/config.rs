//! Configuration management for kwip
//!
//! Settings come from built-in defaults, an optional TOML/YAML/JSON file and
//! `KWIP_*` environment variables, in that order. Command line flags are
//! applied last by the binary. The configuration is validated after every
//! change.

use crate::error::{KwipError, Result};
use crate::logging::{LogLevel, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use validator::Validate;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KwipConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Kernel engine configuration
    #[validate(nested)]
    pub engine: EngineSettings,

    /// Matrix output configuration
    #[validate(nested)]
    pub output: OutputSettings,
}

/// Kernel engine settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineSettings {
    /// Number of worker threads (0 = all cores)
    #[validate(range(min = 0, max = 1024))]
    pub num_threads: usize,

    /// Normalise `d2` by table totals
    pub normalize: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            num_threads: 0,
            normalize: false,
        }
    }
}

/// Matrix output settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OutputSettings {
    pub format: OutputFormat,

    pub compression: CompressionType,

    /// Compression level (1-9, higher = better compression, slower)
    #[validate(range(min = 1, max = 9))]
    pub compression_level: u32,

    /// Significant digits of written values
    #[validate(range(min = 1, max = 17))]
    pub precision: usize,

    /// Write a `.sha256` file next to every matrix
    pub generate_checksums: bool,

    /// Directory relative output paths are resolved against
    pub output_dir: Option<PathBuf>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::Tsv,
            compression: CompressionType::None,
            compression_level: 6,
            precision: 8,
            generate_checksums: false,
            output_dir: None,
        }
    }
}

/// Supported matrix formats
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Tab-separated values
    Tsv,
    /// JavaScript Object Notation
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Tsv => write!(f, "tsv"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Supported compression types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
    Bzip2,
}

impl CompressionType {
    /// File extension appended to compressed outputs
    pub fn extension(self) -> Option<&'static str> {
        match self {
            CompressionType::None => None,
            CompressionType::Gzip => Some("gz"),
            CompressionType::Bzip2 => Some("bz2"),
        }
    }
}

/// Holds and validates the active configuration
#[derive(Debug, Default)]
pub struct ConfigManager {
    config: KwipConfig,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: KwipConfig) -> Result<Self> {
        let manager = Self { config };
        manager.validate("Configuration validation failed")?;
        Ok(manager)
    }

    /// Load configuration from a `.toml`, `.yaml`/`.yml` or `.json` file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| KwipError::io_error(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: KwipConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| KwipError::config(format!("TOML parse error: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| KwipError::config(format!("YAML parse error: {}", e)))?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| KwipError::config(format!("JSON parse error: {}", e)))?,
            _ => {
                return Err(KwipError::config(
                    "Unsupported config file format. Use .toml, .yaml, .yml, or .json",
                ));
            }
        };

        Self::from_config(config)
    }

    /// Merge `KWIP_*` environment variables into the current config
    pub fn load_from_env(&mut self) -> Result<()> {
        if let Ok(threads) = env::var("KWIP_THREADS") {
            self.config.engine.num_threads = threads
                .parse()
                .map_err(|e| KwipError::config(format!("Invalid KWIP_THREADS: {}", e)))?;
        }

        if let Ok(log_level) = env::var("KWIP_LOG_LEVEL") {
            self.config.logging.level = log_level
                .to_lowercase()
                .parse::<LogLevel>()
                .map_err(|_| KwipError::config(format!("Invalid log level: {}", log_level)))?;
        }

        if let Ok(json_logs) = env::var("KWIP_JSON_LOGS") {
            self.config.logging.json_format = json_logs
                .parse()
                .map_err(|e| KwipError::config(format!("Invalid KWIP_JSON_LOGS: {}", e)))?;
        }

        if let Ok(output_dir) = env::var("KWIP_OUTPUT_DIR") {
            self.config.output.output_dir = Some(PathBuf::from(output_dir));
        }

        self.validate("Configuration validation failed after env override")
    }

    /// Apply `f` to the config and re-validate
    pub fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut KwipConfig),
    {
        f(&mut self.config);
        self.validate("Configuration validation failed after update")
    }

    pub fn config(&self) -> &KwipConfig {
        &self.config
    }

    pub fn into_config(self) -> KwipConfig {
        self.config
    }

    /// Worker thread count with 0 resolved to rayon's default
    pub fn num_threads(&self) -> usize {
        match self.config.engine.num_threads {
            0 => rayon::current_num_threads(),
            n => n,
        }
    }

    /// Resolve an output path against `output.output_dir`
    pub fn output_path<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        match &self.config.output.output_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Save current configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::to_string_pretty(&self.config)
                .map_err(|e| KwipError::config(format!("TOML serialize error: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(&self.config)
                .map_err(|e| KwipError::config(format!("YAML serialize error: {}", e)))?,
            Some("json") => serde_json::to_string_pretty(&self.config)
                .map_err(|e| KwipError::config(format!("JSON serialize error: {}", e)))?,
            _ => {
                return Err(KwipError::config(
                    "Unsupported config file format. Use .toml, .yaml, .yml, or .json",
                ));
            }
        };

        std::fs::write(path, content)
            .map_err(|e| KwipError::io_error(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    fn validate(&self, context: &str) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| KwipError::config(format!("{}: {}", context, e)))
    }
}
