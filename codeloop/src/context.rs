//! Run-scoped state shared with the interrupt handler.

use std::sync::{Arc, Mutex};

use crate::cancel::CancelToken;
use crate::io::terminal::Terminal;

/// Backend session currently held by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSession {
    pub backend: &'static str,
    pub id: String,
}

/// Everything a mission run shares across components and with the signal
/// handler. Cloning is cheap; clones refer to the same run.
#[derive(Clone)]
pub struct RunContext {
    pub cancel: CancelToken,
    pub terminal: Arc<Terminal>,
    live: Arc<Mutex<Option<LiveSession>>>,
}

impl RunContext {
    pub fn new(terminal: Terminal) -> Self {
        Self {
            cancel: CancelToken::new(),
            terminal: Arc::new(terminal),
            live: Arc::new(Mutex::new(None)),
        }
    }

    /// Context with no visible output, for tests and `--quiet`.
    pub fn quiet() -> Self {
        Self::new(Terminal::hidden())
    }

    /// React to a user interrupt: fail running spinners and cancel the run.
    ///
    /// Returns `false` when the run was already cancelled (repeated signal).
    pub fn interrupt(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.terminal.fail_active("interrupted by user");
        self.cancel.cancel();
        true
    }

    /// Record the session acquired for this run, or clear it on release.
    pub fn set_live_session(&self, session: Option<LiveSession>) {
        if let Ok(mut live) = self.live.lock() {
            *live = session;
        }
    }

    /// Session that has been acquired and not yet released.
    pub fn live_session(&self) -> Option<LiveSession> {
        self.live.lock().ok().and_then(|live| live.clone())
    }
}
