//! WAL segment management.
//!
//! The log is split into size-bounded segment files named
//! `segment-<index>`. The segment with the highest index is the one open
//! for appends; every other segment is immutable.

use crate::error::WalError;
use crate::SEGMENT_PREFIX;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Segment index (numeric file name suffix).
pub type SegmentIndex = u64;

/// Segment file name for the given index.
pub fn segment_filename(index: SegmentIndex) -> String {
    format!("{}{}", SEGMENT_PREFIX, index)
}

/// Parses the segment index from a file name.
///
/// Returns `Ok(None)` for files that are not segments. A file that carries
/// the segment prefix but no numeric suffix is an error.
pub fn parse_segment_filename(name: &str) -> Result<Option<SegmentIndex>, WalError> {
    let Some(suffix) = name.strip_prefix(SEGMENT_PREFIX) else {
        return Ok(None);
    };
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WalError::InvalidSegmentName(name.to_string()));
    }
    suffix
        .parse()
        .map(Some)
        .map_err(|_| WalError::InvalidSegmentName(name.to_string()))
}

/// The segment currently open for appends.
pub struct ActiveSegment {
    index: SegmentIndex,
    path: PathBuf,
    writer: BufWriter<File>,
    sync_pending: bool,
    /// Set once an append fails; the file may end in a partial frame.
    failed: bool,
}

impl ActiveSegment {
    /// Opens (creating if missing) a segment for appending.
    pub fn open(dir: &Path, index: SegmentIndex) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(index));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self::from_file(index, path, file))
    }

    /// Creates a fresh segment; fails if the file already exists.
    pub fn create(dir: &Path, index: SegmentIndex) -> Result<Self, WalError> {
        let (path, file) = SegmentStore::create_segment(dir, index)?;
        Ok(Self::from_file(index, path, file))
    }

    pub(crate) fn from_file(index: SegmentIndex, path: PathBuf, file: File) -> Self {
        Self {
            index,
            path,
            writer: BufWriter::new(file),
            sync_pending: false,
            failed: false,
        }
    }

    /// Returns the segment index.
    pub fn index(&self) -> SegmentIndex {
        self.index
    }

    /// Returns the segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the file on disk, excluding buffered bytes.
    pub fn size_on_disk(&self) -> Result<u64, WalError> {
        Ok(self.writer.get_ref().metadata()?.len())
    }

    /// Bytes sitting in the write buffer.
    pub fn buffered(&self) -> usize {
        self.writer.buffer().len()
    }

    /// Writes one frame (length prefix + body) into the buffer.
    ///
    /// Returns the number of bytes framed. Once an append has failed, part
    /// of the frame may already be in the file, and every later append on
    /// this segment is refused.
    pub fn append_frame(&mut self, body: &[u8]) -> Result<usize, WalError> {
        if self.failed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "segment {} is unusable after a failed append",
                    self.index
                ),
            )
            .into());
        }
        let len = i32::try_from(body.len()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("record of {} bytes does not fit a frame", body.len()),
            )
        })?;

        let mut frame = Vec::with_capacity(crate::FRAME_HEADER_SIZE + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(body);
        if let Err(e) = self.writer.write_all(&frame) {
            self.failed = true;
            return Err(e.into());
        }
        self.sync_pending = true;
        Ok(frame.len())
    }

    /// Drains the buffer to the file, then syncs it when `fsync` is set.
    ///
    /// Returns whether a physical sync was issued.
    pub fn flush(&mut self, fsync: bool) -> Result<bool, WalError> {
        self.writer.flush()?;
        if fsync && self.sync_pending {
            self.writer.get_ref().sync_data()?;
            self.sync_pending = false;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Segment directory operations.
pub struct SegmentStore;

impl SegmentStore {
    /// Lists all segments in a directory, sorted by numeric index.
    pub fn list_segments(dir: &Path) -> Result<Vec<(SegmentIndex, PathBuf)>, WalError> {
        let mut segments = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(index) = parse_segment_filename(&name)? {
                segments.push((index, entry.path()));
            }
        }

        segments.sort_by_key(|(index, _)| *index);
        Ok(segments)
    }

    /// Index of the current segment, or 0 for a fresh log.
    pub fn highest_index(segments: &[(SegmentIndex, PathBuf)]) -> SegmentIndex {
        segments.iter().map(|(index, _)| *index).max().unwrap_or(0)
    }

    /// The segment with the lowest index, if any.
    pub fn oldest(segments: &[(SegmentIndex, PathBuf)]) -> Option<&(SegmentIndex, PathBuf)> {
        segments.iter().min_by_key(|(index, _)| *index)
    }

    /// Creates a new, empty segment file.
    pub fn create_segment(dir: &Path, index: SegmentIndex) -> Result<(PathBuf, File), WalError> {
        let path = dir.join(segment_filename(index));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        Ok((path, file))
    }

    /// Deletes the segment with the lowest index.
    ///
    /// Retention is purely count based: the deleted segment may hold the
    /// most recent checkpoint. Returns the deleted index, or `None` when the
    /// directory has no segments.
    pub fn delete_oldest(dir: &Path) -> Result<Option<SegmentIndex>, WalError> {
        let segments = Self::list_segments(dir)?;
        let Some((index, path)) = Self::oldest(&segments) else {
            return Ok(None);
        };
        std::fs::remove_file(path)?;
        Ok(Some(*index))
    }
}
