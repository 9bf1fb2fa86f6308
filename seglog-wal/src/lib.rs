//! # seglog-wal
//!
//! Segmented Write-Ahead Log.
//!
//! This crate provides a durable, append-only log with:
//! - Monotonic sequence numbers that survive restarts
//! - Per-record CRC-32 checksums for corruption detection
//! - Size-bounded segment files with count-based retention
//! - Checkpoint markers for replaying only the tail of the log
//! - A background flush scheduler with optional fsync

pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod flush;
pub mod recovery;
pub mod segment;
pub mod wal;

pub use config::WalConfig;
pub use entry::WalEntry;
pub use error::{ConfigError, DecodeError, WalError};
pub use recovery::{verify_wal, VerifyReport};
pub use segment::{SegmentIndex, SegmentStore};
pub use wal::{Wal, WalStats};

use std::time::Duration;

/// File name prefix shared by all segments.
pub const SEGMENT_PREFIX: &str = "segment-";

/// Default segment size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of segment files kept on disk.
pub const DEFAULT_MAX_SEGMENTS: usize = 10;

/// Interval of the background flush.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Size of the little-endian length prefix in front of every record.
pub const FRAME_HEADER_SIZE: usize = 4;
