//! Cooperative cancellation for a mission run.
//!
//! A [`CancelToken`] is checked before every suspension point and polled while
//! long calls wait, so an interrupt unwinds through the same cleanup path as
//! any other error.

use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// How often blocked calls re-check the token.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The run was cancelled by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted by user")]
pub struct Interrupted;

/// Shared cancellation flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`Interrupted`] once the token has been cancelled.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_cancelled() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Run a blocking call on a helper thread and stop waiting on cancellation.
    ///
    /// The helper thread is detached when cancelled; its result is dropped.
    pub fn run_blocking<T, F>(&self, f: F) -> Result<T, Interrupted>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.check()?;
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _ = tx.send(f());
        });
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => self.check()?,
                // Sender dropped without a value: the closure panicked.
                Err(RecvTimeoutError::Disconnected) => match handle.join() {
                    Err(payload) => panic::resume_unwind(payload),
                    Ok(()) => unreachable!("helper thread exited without sending"),
                },
            }
        }
    }
}
