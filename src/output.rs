//! Matrix output
//!
//! Kernel and distance matrices are written as TSV or JSON, optionally
//! compressed, with an optional SHA-256 sidecar file.

use crate::config::{CompressionType, OutputFormat, OutputSettings};
use crate::error::{KwipError, Result};
use crate::matrix::KernelMatrix;
use bzip2::write::BzEncoder;
use chrono::{DateTime, Utc};
use flate2::{Compression, write::GzEncoder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Which matrix a file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixKind {
    Kernel,
    Distance,
}

impl fmt::Display for MatrixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixKind::Kernel => write!(f, "kernel"),
            MatrixKind::Distance => write!(f, "distance"),
        }
    }
}

/// Run information embedded in JSON output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputMetadata {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub metric: String,
}

impl OutputMetadata {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            metric: metric.into(),
        }
    }
}

#[derive(Serialize)]
struct MatrixDocument<'a> {
    metadata: &'a OutputMetadata,
    kind: MatrixKind,
    names: &'a [String],
    matrix: Vec<&'a [f64]>,
}

/// Checksum information for an output file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChecksum {
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub created: DateTime<Utc>,
}

/// Writer that can compress output based on configuration
pub enum CompressedWriter {
    Plain(BufWriter<File>),
    Gzip(BufWriter<GzEncoder<File>>),
    Bzip2(BufWriter<BzEncoder<File>>),
}

impl CompressedWriter {
    pub fn new(path: &Path, compression: CompressionType, compression_level: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                KwipError::io_error(format!("Failed to create output file {}: {}", path.display(), e))
            })?;

        let writer = match compression {
            CompressionType::None => Self::Plain(BufWriter::new(file)),
            CompressionType::Gzip => {
                let encoder = GzEncoder::new(file, Compression::new(compression_level));
                Self::Gzip(BufWriter::new(encoder))
            }
            CompressionType::Bzip2 => {
                let encoder = BzEncoder::new(file, bzip2::Compression::new(compression_level));
                Self::Bzip2(BufWriter::new(encoder))
            }
        };

        Ok(writer)
    }

    /// Flush buffers, write any compression trailer and sync the file.
    pub fn finish(self) -> Result<()> {
        let file = match self {
            Self::Plain(writer) => writer.into_inner().map_err(|e| e.into_error())?,
            Self::Gzip(writer) => writer.into_inner().map_err(|e| e.into_error())?.finish()?,
            Self::Bzip2(writer) => writer.into_inner().map_err(|e| e.into_error())?.finish()?,
        };
        file.sync_all()?;
        Ok(())
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(writer) => writer.write(buf),
            Self::Gzip(writer) => writer.write(buf),
            Self::Bzip2(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(writer) => writer.flush(),
            Self::Gzip(writer) => writer.flush(),
            Self::Bzip2(writer) => writer.flush(),
        }
    }
}

/// Writes matrices to files according to [`OutputSettings`]
pub struct MatrixWriter {
    settings: OutputSettings,
    metadata: OutputMetadata,
}

impl MatrixWriter {
    pub fn new(settings: OutputSettings, metadata: OutputMetadata) -> Self {
        Self { settings, metadata }
    }

    pub fn settings(&self) -> &OutputSettings {
        &self.settings
    }

    /// Final file path: relative paths go under `output_dir` and compressed
    /// outputs get the compression extension.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        let mut resolved = match &self.settings.output_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        if let Some(ext) = self.settings.compression.extension() {
            if resolved.extension().and_then(|e| e.to_str()) != Some(ext) {
                let mut name = resolved.into_os_string();
                name.push(".");
                name.push(ext);
                resolved = PathBuf::from(name);
            }
        }
        resolved
    }

    /// Write `matrix` to `path`. Returns the written path and, when enabled,
    /// the checksum recorded in `<path>.sha256`.
    pub fn write(
        &self,
        matrix: &KernelMatrix,
        kind: MatrixKind,
        path: &Path,
    ) -> Result<(PathBuf, Option<FileChecksum>)> {
        let path = self.resolve_path(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = CompressedWriter::new(&path, self.settings.compression, self.settings.compression_level)?;
        self.write_to(matrix, kind, &mut writer)?;
        writer.finish()?;
        info!(
            path = %path.display(),
            kind = %kind,
            format = %self.settings.format,
            samples = matrix.len(),
            "Wrote matrix"
        );

        let checksum = if self.settings.generate_checksums {
            let checksum = generate_checksum(&path)?;
            write_checksum_file(&checksum)?;
            Some(checksum)
        } else {
            None
        };
        Ok((path, checksum))
    }

    /// Write `matrix` in the configured format to any writer.
    ///
    /// TSV honours `precision`; JSON carries full `f64` values.
    pub fn write_to<W: Write>(&self, matrix: &KernelMatrix, kind: MatrixKind, mut writer: W) -> Result<()> {
        match self.settings.format {
            OutputFormat::Tsv => matrix.write_tsv(writer, self.settings.precision),
            OutputFormat::Json => {
                let document = MatrixDocument {
                    metadata: &self.metadata,
                    kind,
                    names: matrix.names(),
                    matrix: matrix.rows().collect(),
                };
                serde_json::to_writer_pretty(&mut writer, &document)
                    .map_err(|e| KwipError::format(format!("JSON serialization error: {}", e)))?;
                writeln!(writer)?;
                writer.flush()?;
                Ok(())
            }
        }
    }
}

/// SHA-256 of a file's bytes
pub fn generate_checksum(path: &Path) -> Result<FileChecksum> {
    let mut file = File::open(path)
        .map_err(|e| KwipError::io_error(format!("Failed to open file for checksum: {}", e)))?;
    let size_bytes = file.metadata()?.len();

    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(FileChecksum {
        file_path: path.to_path_buf(),
        size_bytes,
        sha256: format!("{:x}", hasher.finalize()),
        created: Utc::now(),
    })
}

/// Write `<file>.sha256` in `sha256sum` format
fn write_checksum_file(checksum: &FileChecksum) -> Result<PathBuf> {
    let mut sidecar = checksum.file_path.clone().into_os_string();
    sidecar.push(".sha256");
    let sidecar = PathBuf::from(sidecar);

    let file_name = checksum
        .file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut writer = BufWriter::new(File::create(&sidecar)?);
    writeln!(writer, "{}  {}", checksum.sha256, file_name)?;
    writer.flush()?;
    Ok(sidecar)
}
