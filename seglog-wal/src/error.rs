//! WAL error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record {sequence} corrupted: checksum mismatch (expected {expected:#x}, got {actual:#x})")]
    Corrupted {
        sequence: u64,
        expected: u32,
        actual: u32,
    },

    #[error("malformed record at offset {offset}: {source}")]
    Malformed {
        offset: u64,
        #[source]
        source: DecodeError,
    },

    #[error("invalid frame length {length} at offset {offset}")]
    InvalidFrame { offset: u64, length: i32 },

    #[error("invalid segment file name: {0}")]
    InvalidSegmentName(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("WAL is closed")]
    Closed,
}

impl WalError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::Io(_))
    }

    /// Returns whether this error signals damaged on-disk data rather than
    /// a failing filesystem.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            WalError::Corrupted { .. } | WalError::Malformed { .. } | WalError::InvalidFrame { .. }
        )
    }
}

/// Errors produced by the entry codec when a record body cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of record while reading {0}")]
    Truncated(&'static str),

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("unsupported wire type {wire_type} for field {field}")]
    UnsupportedWireType { field: u64, wire_type: u8 },

    #[error("field {field} has wire type {wire_type}, expected {expected}")]
    WireTypeMismatch {
        field: u64,
        wire_type: u8,
        expected: u8,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    ParseError(PathBuf, String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}
