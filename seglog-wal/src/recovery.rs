//! WAL recovery and replay.
//!
//! All readers open their own file handles and never take the writer lock.
//! A reader looking at the live segment only sees what was flushed before
//! it started.
//!
//! Torn writes are tolerated only at a frame boundary: a segment that ends
//! exactly after a complete frame scans cleanly, while a truncated length
//! field or body is reported as an I/O error. Nothing is ever truncated.

use crate::codec;
use crate::entry::WalEntry;
use crate::error::WalError;
use crate::segment::{SegmentIndex, SegmentStore};
use crate::FRAME_HEADER_SIZE;
use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Result of scanning a single segment.
#[derive(Debug, Default)]
pub struct SegmentScan {
    /// Entries in on-disk order. When scanned with `from_checkpoint`, only
    /// the entries starting at the last checkpoint.
    pub entries: Vec<WalEntry>,
    /// Sequence number of the last checkpoint seen in the segment.
    pub checkpoint: Option<u64>,
}

/// Reads every frame of a segment from the start.
///
/// With `from_checkpoint`, each checkpoint discards what was accumulated
/// before it.
pub fn read_segment(path: &Path, from_checkpoint: bool) -> Result<SegmentScan, WalError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut scan = SegmentScan::default();
    let mut offset = 0u64;

    while let Some(length) = read_frame_len(&mut reader, offset)? {
        let body_offset = offset + FRAME_HEADER_SIZE as u64;
        let body = read_body(&mut reader, length)?;
        let entry = codec::decode_and_verify(body, body_offset)?;
        offset = body_offset + length as u64;

        if entry.is_checkpoint() {
            scan.checkpoint = Some(entry.sequence_number);
            if from_checkpoint {
                scan.entries.clear();
            }
        }
        scan.entries.push(entry);
    }

    Ok(scan)
}

/// Reads one segment for replay.
///
/// With `from_checkpoint`, a segment without any checkpoint yields nothing.
pub fn replay_segment(path: &Path, from_checkpoint: bool) -> Result<Vec<WalEntry>, WalError> {
    let scan = read_segment(path, from_checkpoint)?;
    if from_checkpoint && scan.checkpoint.is_none() {
        return Ok(Vec::new());
    }
    Ok(scan.entries)
}

/// Replays every segment whose index is at least `start`, in index order.
///
/// With `from_checkpoint`, a checkpoint newer than any seen so far discards
/// everything accumulated from earlier segments; if no checkpoint is found
/// at all the result is empty.
pub fn replay_from(
    dir: &Path,
    start: SegmentIndex,
    from_checkpoint: bool,
) -> Result<Vec<WalEntry>, WalError> {
    let mut entries = Vec::new();
    let mut last_checkpoint: Option<u64> = None;

    for (index, path) in SegmentStore::list_segments(dir)? {
        if index < start {
            continue;
        }

        let scan = read_segment(&path, from_checkpoint)?;
        if from_checkpoint {
            if let Some(checkpoint) = scan.checkpoint {
                if last_checkpoint.map_or(true, |prev| checkpoint > prev) {
                    last_checkpoint = Some(checkpoint);
                    entries.clear();
                }
            }
        }
        entries.extend(scan.entries);
    }

    if from_checkpoint && last_checkpoint.is_none() {
        return Ok(Vec::new());
    }
    Ok(entries)
}

/// Finds the last entry of a segment.
///
/// Only length fields are read while walking the segment; bodies are
/// skipped by seeking. Once the walk reaches a clean end of file, the last
/// frame's body is read and decoded. A body shorter than its declared length
/// fails the call.
pub fn last_entry(path: &Path) -> Result<Option<WalEntry>, WalError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut last: Option<(u64, usize)> = None;
    let mut offset = 0u64;

    while let Some(length) = read_frame_len(&mut reader, offset)? {
        let body_offset = offset + FRAME_HEADER_SIZE as u64;
        reader.seek_relative(length as i64)?;
        last = Some((body_offset, length));
        offset = body_offset + length as u64;
    }

    let Some((body_offset, length)) = last else {
        return Ok(None);
    };

    reader.seek(SeekFrom::Start(body_offset))?;
    let body = read_body(&mut reader, length)?;
    codec::decode_and_verify(body, body_offset).map(Some)
}

/// Recovers the last assigned sequence number.
///
/// Segments are consulted from the highest index down until one holds an
/// entry, so an empty segment left behind by a rotation does not reset the
/// counter. Returns 0 for a log without entries.
pub fn recover_last_sequence(segments: &[(SegmentIndex, PathBuf)]) -> Result<u64, WalError> {
    for (index, path) in segments.iter().rev() {
        if let Some(entry) = last_entry(path)? {
            tracing::debug!(
                "Recovered sequence {} from segment {}",
                entry.sequence_number,
                index
            );
            return Ok(entry.sequence_number);
        }
    }
    Ok(0)
}

/// Per-segment verification result.
#[derive(Debug)]
pub struct SegmentReport {
    pub index: SegmentIndex,
    pub records: u64,
    pub checkpoints: u64,
    pub max_sequence: u64,
    /// Error that stopped the scan of this segment, if any.
    pub error: Option<String>,
}

/// Result of a read-only WAL verification.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub segments: Vec<SegmentReport>,
}

impl VerifyReport {
    /// Number of records that decoded and verified.
    pub fn valid_records(&self) -> u64 {
        self.segments.iter().map(|s| s.records).sum()
    }

    /// Highest sequence number seen in any segment.
    pub fn max_sequence(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.max_sequence)
            .max()
            .unwrap_or(0)
    }

    /// Returns whether every segment scanned to a clean end.
    pub fn is_clean(&self) -> bool {
        self.segments.iter().all(|s| s.error.is_none())
    }
}

/// Scans every segment without modifying anything.
///
/// A damaged segment is reported and the scan moves on to the next one.
pub fn verify_wal(dir: impl AsRef<Path>) -> Result<VerifyReport, WalError> {
    let mut report = VerifyReport::default();

    for (index, path) in SegmentStore::list_segments(dir.as_ref())? {
        let segment = match read_segment(&path, false) {
            Ok(scan) => SegmentReport {
                index,
                records: scan.entries.len() as u64,
                checkpoints: scan.entries.iter().filter(|e| e.is_checkpoint()).count() as u64,
                max_sequence: scan
                    .entries
                    .iter()
                    .map(|e| e.sequence_number)
                    .max()
                    .unwrap_or(0),
                error: None,
            },
            Err(e) => {
                tracing::warn!("Segment {} failed verification: {}", index, e);
                SegmentReport {
                    index,
                    records: 0,
                    checkpoints: 0,
                    max_sequence: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        report.segments.push(segment);
    }

    Ok(report)
}

/// Reads a frame length field. `Ok(None)` means a clean end of file.
fn read_frame_len<R: Read>(reader: &mut R, offset: u64) -> Result<Option<usize>, WalError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;

    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("truncated frame length at offset {}", offset),
                )
                .into())
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let length = i32::from_le_bytes(header);
    usize::try_from(length)
        .map(Some)
        .map_err(|_| WalError::InvalidFrame { offset, length })
}

fn read_body<R: Read>(reader: &mut R, length: usize) -> Result<Bytes, WalError> {
    let mut body = Vec::new();
    reader.take(length as u64).read_to_end(&mut body)?;
    if body.len() < length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame body truncated: {} of {} bytes", body.len(), length),
        )
        .into());
    }
    Ok(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::ActiveSegment;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_segment(dir: &Path, index: SegmentIndex, entries: &[WalEntry]) -> PathBuf {
        let mut segment = ActiveSegment::create(dir, index).unwrap();
        for entry in entries {
            segment.append_frame(&codec::encode(entry)).unwrap();
        }
        segment.flush(false).unwrap();
        segment.path().to_path_buf()
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
    }

    fn sequences(entries: &[WalEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.sequence_number).collect()
    }

    #[test]
    fn test_read_segment_all_entries() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(
            dir.path(),
            0,
            &[
                WalEntry::new(1, &b"a"[..]),
                WalEntry::checkpoint(2, &b"b"[..]),
                WalEntry::new(3, &b"c"[..]),
            ],
        );

        let scan = read_segment(&path, false).unwrap();
        assert_eq!(sequences(&scan.entries), vec![1, 2, 3]);
        assert_eq!(scan.entries[0].payload, Bytes::from_static(b"a"));
        assert!(scan.entries[1].is_checkpoint());
        assert_eq!(scan.checkpoint, Some(2));
    }

    #[test]
    fn test_read_segment_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(
            dir.path(),
            0,
            &[
                WalEntry::new(1, &b"A"[..]),
                WalEntry::new(2, &b"B"[..]),
                WalEntry::checkpoint(3, &b"C"[..]),
                WalEntry::new(4, &b"D"[..]),
            ],
        );

        let scan = read_segment(&path, true).unwrap();
        assert_eq!(sequences(&scan.entries), vec![3, 4]);
        assert_eq!(scan.checkpoint, Some(3));
    }

    #[test]
    fn test_read_segment_later_checkpoint_wins() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(
            dir.path(),
            0,
            &[
                WalEntry::new(1, &b"A"[..]),
                WalEntry::checkpoint(2, &b"cp1"[..]),
                WalEntry::new(3, &b"B"[..]),
                WalEntry::checkpoint(4, &b"cp2"[..]),
                WalEntry::new(5, &b"C"[..]),
            ],
        );

        let scan = read_segment(&path, true).unwrap();
        assert_eq!(sequences(&scan.entries), vec![4, 5]);
        assert_eq!(scan.entries[0].payload, Bytes::from_static(b"cp2"));
        assert_eq!(scan.checkpoint, Some(4));
        assert_eq!(sequences(&replay_segment(&path, true).unwrap()), vec![4, 5]);
    }

    #[test]
    fn test_replay_segment_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(
            dir.path(),
            0,
            &[WalEntry::new(1, &b"A"[..]), WalEntry::new(2, &b"B"[..])],
        );

        assert!(replay_segment(&path, true).unwrap().is_empty());
        assert_eq!(sequences(&replay_segment(&path, false).unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_read_empty_segment() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), 0, &[]);
        assert!(read_segment(&path, false).unwrap().entries.is_empty());
        assert!(last_entry(&path).unwrap().is_none());
    }

    #[test]
    fn test_truncated_body_fails_full_scan() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), 0, &[WalEntry::new(1, &b"ok"[..])]);
        append_raw(&path, &100i32.to_le_bytes());
        append_raw(&path, b"short");

        match read_segment(&path, false) {
            Err(WalError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_length_fails_full_scan() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), 0, &[WalEntry::new(1, &b"ok"[..])]);
        append_raw(&path, &[0x05, 0x00]);

        match read_segment(&path, false) {
            Err(WalError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_length_is_invalid_frame() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), 0, &[WalEntry::new(1, &b"ok"[..])]);
        append_raw(&path, &(-1i32).to_le_bytes());

        let err = read_segment(&path, false).unwrap_err();
        assert!(matches!(err, WalError::InvalidFrame { length: -1, .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_flipped_payload_byte_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), 0, &[WalEntry::new(1, &b"hello"[..])]);

        // frame length (4) + sequence field (2) + payload key and length (2)
        let mut raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[8..13], b"hello");
        raw[9] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        let err = read_segment(&path, false).unwrap_err();
        assert!(matches!(err, WalError::Corrupted { sequence: 1, .. }));
        assert!(last_entry(&path).is_err());
    }

    #[test]
    fn test_last_entry() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(
            dir.path(),
            0,
            &[
                WalEntry::new(1, vec![1u8; 10_000]),
                WalEntry::new(2, &b"x"[..]),
                WalEntry::checkpoint(3, &b"last"[..]),
            ],
        );

        let entry = last_entry(&path).unwrap().unwrap();
        assert_eq!(entry.sequence_number, 3);
        assert_eq!(entry.payload, Bytes::from_static(b"last"));
        assert!(entry.is_checkpoint());
    }

    #[test]
    fn test_last_entry_torn_final_frame_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), 0, &[WalEntry::new(1, &b"whole"[..])]);
        append_raw(&path, &64i32.to_le_bytes());
        append_raw(&path, &[0x08, 0x02]);

        match last_entry(&path) {
            Err(WalError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }

    #[test]
    fn test_last_entry_torn_length_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_segment(dir.path(), 0, &[WalEntry::new(1, &b"whole"[..])]);
        append_raw(&path, &[0x01]);

        assert!(matches!(last_entry(&path), Err(WalError::Io(_))));
    }

    #[test]
    fn test_replay_from_orders_numerically() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 10, &[WalEntry::new(3, &b"c"[..])]);
        write_segment(dir.path(), 2, &[WalEntry::new(2, &b"b"[..])]);
        write_segment(dir.path(), 1, &[WalEntry::new(1, &b"a"[..])]);

        let entries = replay_from(dir.path(), 0, false).unwrap();
        assert_eq!(sequences(&entries), vec![1, 2, 3]);

        let entries = replay_from(dir.path(), 2, false).unwrap();
        assert_eq!(sequences(&entries), vec![2, 3]);
    }

    #[test]
    fn test_replay_from_checkpoint_across_segments() {
        let dir = TempDir::new().unwrap();
        write_segment(
            dir.path(),
            0,
            &[
                WalEntry::new(1, &b"a"[..]),
                WalEntry::checkpoint(2, &b"cp1"[..]),
                WalEntry::new(3, &b"b"[..]),
            ],
        );
        write_segment(dir.path(), 1, &[WalEntry::new(4, &b"c"[..])]);

        let entries = replay_from(dir.path(), 0, true).unwrap();
        assert_eq!(sequences(&entries), vec![2, 3, 4]);

        write_segment(
            dir.path(),
            2,
            &[
                WalEntry::new(5, &b"d"[..]),
                WalEntry::checkpoint(6, &b"cp2"[..]),
                WalEntry::new(7, &b"e"[..]),
            ],
        );

        let entries = replay_from(dir.path(), 0, true).unwrap();
        assert_eq!(sequences(&entries), vec![6, 7]);
    }

    #[test]
    fn test_replay_from_checkpoint_none_found() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 0, &[WalEntry::new(1, &b"a"[..])]);
        write_segment(dir.path(), 1, &[WalEntry::new(2, &b"b"[..])]);

        assert!(replay_from(dir.path(), 0, true).unwrap().is_empty());
        assert_eq!(replay_from(dir.path(), 0, false).unwrap().len(), 2);
    }

    #[test]
    fn test_recover_last_sequence_skips_empty_segment() {
        let dir = TempDir::new().unwrap();
        write_segment(
            dir.path(),
            0,
            &[WalEntry::new(1, &b"a"[..]), WalEntry::new(2, &b"b"[..])],
        );
        write_segment(dir.path(), 1, &[]);

        let segments = SegmentStore::list_segments(dir.path()).unwrap();
        assert_eq!(recover_last_sequence(&segments).unwrap(), 2);
        assert_eq!(recover_last_sequence(&[]).unwrap(), 0);
    }

    #[test]
    fn test_verify_wal() {
        let dir = TempDir::new().unwrap();
        write_segment(
            dir.path(),
            0,
            &[
                WalEntry::new(1, &b"a"[..]),
                WalEntry::checkpoint(2, &b"b"[..]),
            ],
        );
        let damaged = write_segment(dir.path(), 1, &[WalEntry::new(3, &b"c"[..])]);

        let report = verify_wal(dir.path()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.valid_records(), 3);
        assert_eq!(report.max_sequence(), 3);
        assert_eq!(report.segments[0].checkpoints, 1);

        append_raw(&damaged, &[0xff, 0xff]);
        let report = verify_wal(dir.path()).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.valid_records(), 2);
        assert!(report.segments[1].error.is_some());

        // Verification never repairs.
        assert!(!verify_wal(dir.path()).unwrap().is_clean());
    }
}
