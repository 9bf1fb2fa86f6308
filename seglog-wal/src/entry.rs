//! WAL entry type.
//!
//! Each segment is a sequence of length-prefixed frames:
//!
//! ```text
//! +----------------+--------------------------------------+
//! | length (i32 LE)| encoded entry                        |
//! | 4 bytes        | length bytes                         |
//! +----------------+--------------------------------------+
//! ```
//!
//! The encoded entry carries the sequence number, the payload, a CRC-32
//! checksum and an optional checkpoint flag. See [`crate::codec`] for the
//! field layout.

use crate::error::WalError;
use bytes::Bytes;

/// A single record in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub sequence_number: u64,
    pub payload: Bytes,
    pub checksum: u32,
    /// `Some(true)` on checkpoint records, `None` otherwise.
    pub is_checkpoint: Option<bool>,
}

impl WalEntry {
    /// Creates a regular (non-checkpoint) entry.
    pub fn new(sequence_number: u64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            sequence_number,
            checksum: checksum(&payload, sequence_number),
            payload,
            is_checkpoint: None,
        }
    }

    /// Creates a checkpoint entry.
    pub fn checkpoint(sequence_number: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            is_checkpoint: Some(true),
            ..Self::new(sequence_number, payload)
        }
    }

    /// Returns whether this entry is a checkpoint marker.
    pub fn is_checkpoint(&self) -> bool {
        self.is_checkpoint.unwrap_or(false)
    }

    /// Recomputes the checksum and compares it with the stored one.
    pub fn verify(&self) -> Result<(), WalError> {
        let actual = checksum(&self.payload, self.sequence_number);
        if actual != self.checksum {
            return Err(WalError::Corrupted {
                sequence: self.sequence_number,
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// CRC-32 (IEEE) over the payload followed by the low-order byte of the
/// sequence number.
///
/// Only one byte of the sequence number is covered. Existing segment files
/// depend on exactly this byte range.
pub fn checksum(payload: &[u8], sequence_number: u64) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.update(&[sequence_number as u8]);
    hasher.finalize()
}
