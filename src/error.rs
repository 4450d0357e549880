//! Error handling for kwip
//!
//! One error type covers the array store, the sample adapter, aggregation,
//! the kernel engine and entropy vector persistence. Variants fall into four
//! groups: I/O, format, configuration and precondition failures.

use crate::array::DType;
use rayon::ThreadPoolBuildError;
use thiserror::Error;

/// Error type for all kwip operations
#[derive(Error, Debug)]
pub enum KwipError {
    /// I/O errors (file open/create, short reads, failed writes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Named array absent from a container file
    #[error("Array '{key}' not found in {path}")]
    KeyNotFound { path: String, key: String },

    /// Sample name unknown to the count source
    #[error("Sample '{0}' not found")]
    SampleNotFound(String),

    /// Malformed container, sample or entropy vector file
    #[error("Format error: {0}")]
    Format(String),

    /// Stored element type differs from the requested one
    #[error("Array '{key}' holds {stored} elements, requested {requested}")]
    TypeMismatch {
        key: String,
        stored: DType,
        requested: DType,
    },

    /// Two samples (or a sample and the run) disagree on table layout
    #[error("Dimension mismatch between '{left}' {left_dims:?} and '{right}' {right_dims:?}")]
    DimensionMismatch {
        left: String,
        left_dims: Vec<usize>,
        right: String,
        right_dims: Vec<usize>,
    },

    /// Unknown kernel/metric name
    #[error("Unknown metric '{0}' (valid metrics: d2, d2pop, js, wip)")]
    UnknownMetric(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation called in a state where it cannot succeed
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Block iterator advanced past its final chunk
    #[error("Block iterator over '{key}' is exhausted")]
    IteratorExhausted { key: String },

    #[error("Thread pool build error: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KwipError {
    /// Create a Format error
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    /// Create a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a Precondition error
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Create a KeyNotFound error
    pub fn key_not_found(path: impl Into<String>, key: impl Into<String>) -> Self {
        Self::KeyNotFound {
            path: path.into(),
            key: key.into(),
        }
    }

    /// Create a DimensionMismatch error
    pub fn dimension_mismatch(
        left: impl Into<String>,
        left_dims: &[usize],
        right: impl Into<String>,
        right_dims: &[usize],
    ) -> Self {
        Self::DimensionMismatch {
            left: left.into(),
            left_dims: left_dims.to_vec(),
            right: right.into(),
            right_dims: right_dims.to_vec(),
        }
    }

    /// Create an I/O error
    pub fn io_error(message: impl Into<String>) -> Self {
        Self::Io(std::io::Error::other(message.into()))
    }
}

/// Result type alias for kwip operations
pub type Result<T> = std::result::Result<T, KwipError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = KwipError::key_not_found("weights.kwa", "entropy");
        assert_eq!(err.to_string(), "Array 'entropy' not found in weights.kwa");

        let err = KwipError::TypeMismatch {
            key: "counts/0".to_string(),
            stored: DType::U16,
            requested: DType::F32,
        };
        assert_eq!(err.to_string(), "Array 'counts/0' holds u16 elements, requested f32");

        let err = KwipError::dimension_mismatch("a", &[4], "b", &[8]);
        assert_eq!(err.to_string(), "Dimension mismatch between 'a' [4] and 'b' [8]");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let kwip_err: KwipError = io_err.into();

        match kwip_err {
            KwipError::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_helper_methods() {
        let err = KwipError::format("bad signature");
        assert!(err.to_string().contains("bad signature"));

        let err = KwipError::config("Invalid thread count");
        assert!(err.to_string().contains("Invalid thread count"));

        let err = KwipError::precondition("no entropy vector");
        assert!(err.to_string().contains("no entropy vector"));
    }
}
