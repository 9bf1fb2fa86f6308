//! Main WAL implementation.

use crate::codec;
use crate::config::WalConfig;
use crate::entry::WalEntry;
use crate::error::WalError;
use crate::flush::{FlushScheduler, FlushTimer};
use crate::recovery;
use crate::segment::{segment_filename, ActiveSegment, SegmentIndex, SegmentStore};
use crate::DEFAULT_FLUSH_INTERVAL;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// I/O statistics for the WAL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalStats {
    /// Records appended, checkpoints included.
    pub writes: u64,
    /// Checkpoint records appended.
    pub checkpoints: u64,
    /// Bytes framed into segments (length prefixes included).
    pub bytes_written: u64,
    /// Buffer drains, explicit and scheduled.
    pub flushes: u64,
    /// Physical syncs issued.
    pub fsyncs: u64,
    /// Segment rotations.
    pub rotations: u64,
    /// Segments removed by retention.
    pub segments_deleted: u64,
}

#[derive(Default)]
struct StatsCounters {
    writes: AtomicU64,
    checkpoints: AtomicU64,
    bytes_written: AtomicU64,
    flushes: AtomicU64,
    fsyncs: AtomicU64,
    rotations: AtomicU64,
    segments_deleted: AtomicU64,
}

/// State mutated by writes, flushes and rotation. Always accessed as a unit
/// under one lock.
struct WriterState {
    /// `None` once the WAL is closed.
    segment: Option<ActiveSegment>,
    last_sequence: u64,
    segment_index: SegmentIndex,
}

/// Parts of the WAL shared with the flush scheduler thread.
struct Shared {
    state: Mutex<WriterState>,
    timer: Arc<FlushTimer>,
    fsync: bool,
    stats: StatsCounters,
}

impl Shared {
    /// Drains the buffer (and syncs when enabled), then resets the timer.
    fn flush_locked(&self, state: &mut WriterState) -> Result<(), WalError> {
        if let Some(segment) = state.segment.as_mut() {
            let synced = segment.flush(self.fsync)?;
            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            if synced {
                self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.timer.reset();
        Ok(())
    }
}

/// Write-Ahead Log.
///
/// One writer at a time: every mutating call holds the writer lock for its
/// whole duration. Reads open their own file handles and see only flushed
/// data.
pub struct Wal {
    config: WalConfig,
    shared: Arc<Shared>,
    scheduler: Mutex<Option<FlushScheduler>>,
    closed: AtomicBool,
}

impl Wal {
    /// Opens or creates a WAL at the configured directory.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        config.validate()?;

        // Create directory if it doesn't exist
        std::fs::create_dir_all(&config.dir)?;

        let segments = SegmentStore::list_segments(&config.dir)?;
        let segment_index = SegmentStore::highest_index(&segments);
        let segment = ActiveSegment::open(&config.dir, segment_index)?;
        let last_sequence = recovery::recover_last_sequence(&segments)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(WriterState {
                segment: Some(segment),
                last_sequence,
                segment_index,
            }),
            timer: Arc::new(FlushTimer::new(DEFAULT_FLUSH_INTERVAL)),
            fsync: config.fsync,
            stats: StatsCounters::default(),
        });

        let scheduler = {
            let shared = Arc::clone(&shared);
            FlushScheduler::spawn(Arc::clone(&shared.timer), move || {
                let mut state = shared.state.lock();
                shared.flush_locked(&mut state)
            })?
        };

        tracing::info!(
            "WAL opened at {}: segment {}, last_sequence={}",
            config.dir.display(),
            segment_index,
            last_sequence
        );

        Ok(Self {
            config,
            shared,
            scheduler: Mutex::new(Some(scheduler)),
            closed: AtomicBool::new(false),
        })
    }

    /// Appends a record and returns its sequence number.
    pub fn write(&self, payload: impl Into<Bytes>) -> Result<u64, WalError> {
        self.append(payload.into(), false)
    }

    /// Appends a checkpoint record and returns its sequence number.
    ///
    /// Everything written before the checkpoint is flushed first. The
    /// checkpoint record itself stays buffered until the next flush.
    pub fn checkpoint(&self, payload: impl Into<Bytes>) -> Result<u64, WalError> {
        self.append(payload.into(), true)
    }

    fn append(&self, payload: Bytes, checkpoint: bool) -> Result<u64, WalError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if self.is_closed() || state.segment.is_none() {
            return Err(WalError::Closed);
        }

        self.rotate_if_needed(state)?;

        if checkpoint {
            self.shared.flush_locked(state)?;
        }

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        let entry = if checkpoint {
            WalEntry::checkpoint(sequence, payload)
        } else {
            WalEntry::new(sequence, payload)
        };

        let body = codec::encode(&entry);
        let segment = state.segment.as_mut().ok_or(WalError::Closed)?;
        let framed = segment.append_frame(&body)?;

        let stats = &self.shared.stats;
        stats.writes.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes_written
            .fetch_add(framed as u64, Ordering::Relaxed);
        if checkpoint {
            stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        }

        Ok(sequence)
    }

    /// Rotates when the current segment, counting buffered bytes, has
    /// reached the configured size.
    fn rotate_if_needed(&self, state: &mut WriterState) -> Result<(), WalError> {
        let size = match state.segment.as_ref() {
            Some(segment) => segment.size_on_disk()? + segment.buffered() as u64,
            None => return Err(WalError::Closed),
        };
        if size >= self.config.segment_size {
            self.rotate_segment(state)?;
        }
        Ok(())
    }

    /// Closes the current segment and opens the next one, deleting the
    /// oldest segment when more than `max_segments` would remain.
    fn rotate_segment(&self, state: &mut WriterState) -> Result<(), WalError> {
        self.shared.flush_locked(state)?;

        let next_index = state.segment_index + 1;
        let segment = ActiveSegment::create(&self.config.dir, next_index)?;
        // Dropping the previous segment closes its file.
        state.segment = Some(segment);
        state.segment_index = next_index;
        self.shared.stats.rotations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Rotated to segment {}", next_index);

        let count = SegmentStore::list_segments(&self.config.dir)?.len();
        if count > self.config.max_segments {
            if let Some(deleted) = SegmentStore::delete_oldest(&self.config.dir)? {
                self.shared
                    .stats
                    .segments_deleted
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!("Deleted WAL segment {} (retention)", deleted);
            }
        }

        Ok(())
    }

    /// Drains buffered records to the current segment, syncing when fsync is
    /// enabled, and defers the next background flush by a full interval.
    pub fn flush(&self) -> Result<(), WalError> {
        let mut state = self.shared.state.lock();
        if self.is_closed() || state.segment.is_none() {
            return Err(WalError::Closed);
        }
        self.shared.flush_locked(&mut state)
    }

    /// Stops the flush scheduler, drains the buffer and releases the
    /// current segment.
    ///
    /// New writes and flushes are refused from the first call on. If the
    /// final drain fails the segment is kept and the error returned, so a
    /// later `close` retries the drain. Closing a fully closed WAL is a
    /// no-op.
    pub fn close(&self) -> Result<(), WalError> {
        self.closed.store(true, Ordering::Release);

        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }

        let mut state = self.shared.state.lock();
        if state.segment.is_none() {
            return Ok(());
        }
        self.shared.flush_locked(&mut state)?;
        state.segment = None;

        tracing::info!(
            "WAL closed at {}: last_sequence={}",
            self.config.dir.display(),
            state.last_sequence
        );
        Ok(())
    }

    /// Reads the current segment.
    ///
    /// With `from_checkpoint`, returns the entries from the last checkpoint
    /// onwards, or nothing when the segment has no checkpoint. Only flushed
    /// records are visible.
    pub fn read_current(&self, from_checkpoint: bool) -> Result<Vec<WalEntry>, WalError> {
        let path = self.current_segment_path();
        recovery::replay_segment(&path, from_checkpoint)
    }

    /// Reads every segment whose index is at least `segment_index`.
    ///
    /// With `from_checkpoint`, returns the entries from the newest
    /// checkpoint onwards, or nothing when no checkpoint is found.
    pub fn read_from(
        &self,
        segment_index: SegmentIndex,
        from_checkpoint: bool,
    ) -> Result<Vec<WalEntry>, WalError> {
        recovery::replay_from(&self.config.dir, segment_index, from_checkpoint)
    }

    /// Returns the last assigned sequence number (0 for an empty log).
    pub fn last_sequence(&self) -> u64 {
        self.shared.state.lock().last_sequence
    }

    /// Returns the index of the segment currently open for appends.
    pub fn current_segment_index(&self) -> SegmentIndex {
        self.shared.state.lock().segment_index
    }

    /// Returns the path of the segment currently open for appends.
    pub fn current_segment_path(&self) -> PathBuf {
        let index = self.current_segment_index();
        self.config.dir.join(segment_filename(index))
    }

    /// Returns the WAL directory.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Returns the configuration the WAL was opened with.
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Returns whether [`Wal::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the current I/O statistics.
    pub fn stats(&self) -> WalStats {
        let stats = &self.shared.stats;
        WalStats {
            writes: stats.writes.load(Ordering::Relaxed),
            checkpoints: stats.checkpoints.load(Ordering::Relaxed),
            bytes_written: stats.bytes_written.load(Ordering::Relaxed),
            flushes: stats.flushes.load(Ordering::Relaxed),
            fsyncs: stats.fsyncs.load(Ordering::Relaxed),
            rotations: stats.rotations.load(Ordering::Relaxed),
            segments_deleted: stats.segments_deleted.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to close WAL on drop: {}", e);
        }
    }
}
