//! Background flush scheduler.
//!
//! A single thread owned by the WAL wakes once per interval and drains the
//! write buffer. Every explicit flush resets the timer, so the next
//! background flush happens a full interval after the last one of either
//! kind. Shutdown is cooperative: the thread only observes the signal while
//! waiting, never in the middle of a flush.

use crate::error::WalError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TimerState {
    deadline: Instant,
    shutdown: bool,
}

/// Resettable deadline shared between the WAL and its scheduler thread.
pub struct FlushTimer {
    interval: Duration,
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

impl FlushTimer {
    /// Creates a timer whose first deadline is one interval from now.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(TimerState {
                deadline: Instant::now() + interval,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Returns the flush interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Pushes the deadline a full interval into the future.
    pub fn reset(&self) {
        self.state.lock().deadline = Instant::now() + self.interval;
    }

    /// Signals the scheduler to stop and wakes it.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wakeup.notify_all();
    }

    /// Returns whether shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Blocks until the deadline passes or shutdown is signalled.
    ///
    /// Returns `true` when a flush is due and `false` on shutdown. A due
    /// deadline is re-armed before returning, so a failing flush does not
    /// spin.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return false;
            }
            let now = Instant::now();
            if now >= state.deadline {
                state.deadline = now + self.interval;
                return true;
            }
            let deadline = state.deadline;
            self.wakeup.wait_until(&mut state, deadline);
        }
    }
}

/// Owned handle to the background flush thread.
pub struct FlushScheduler {
    timer: Arc<FlushTimer>,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Starts the scheduler thread.
    ///
    /// `flush` runs once per due tick. It must take whatever lock guards the
    /// write buffer itself; errors are logged and the loop keeps going.
    pub fn spawn<F>(timer: Arc<FlushTimer>, mut flush: F) -> Result<Self, WalError>
    where
        F: FnMut() -> Result<(), WalError> + Send + 'static,
    {
        let thread_timer = Arc::clone(&timer);
        let handle = thread::Builder::new()
            .name("seglog-flush".to_string())
            .spawn(move || {
                tracing::debug!(
                    "Flush scheduler started (interval={:?})",
                    thread_timer.interval()
                );
                while thread_timer.wait() {
                    if let Err(e) = flush() {
                        tracing::warn!("Background WAL flush failed: {}", e);
                    }
                }
                tracing::debug!("Flush scheduler stopped");
            })?;

        Ok(Self {
            timer,
            handle: Some(handle),
        })
    }

    /// Signals the thread to stop and waits for it to exit.
    pub fn shutdown(&mut self) {
        self.timer.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Flush scheduler thread panicked");
            }
        }
    }

    /// Returns whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
