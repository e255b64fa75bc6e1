//! Isolated runtimes that execute generated code.
//!
//! The orchestrator drives exactly one [`ExecutionBackend`] per run and never
//! learns which implementation it holds.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use anyhow::Result;
use thiserror::Error;

use crate::cancel::CancelToken;

pub mod container;
pub mod page;

pub use container::ContainerRuntime;
pub use page::SandboxedPage;

/// Session returned by [`ExecutionBackend::acquire`].
///
/// Not `Clone`: [`ExecutionBackend::release`] takes it by value, so a session
/// cannot be released twice.
#[derive(Debug, PartialEq, Eq)]
pub struct BackendHandle {
    id: String,
}

impl BackendHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Result of running one program.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    /// Combined stdout and stderr as the program printed them.
    pub output: String,
    /// `None` when the runtime does not report one or the program was killed.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("container engine is not running")]
    EngineNotRunning,
    #[error("container image {0:?} was not found; pull or build it first")]
    ImageNotFound(String),
    #[error("backend session is not acquired")]
    NotAcquired,
}

/// Runtime that can hold a dataset and execute generated Node.js programs.
pub trait ExecutionBackend {
    fn name(&self) -> &'static str;

    /// Start a session. On error nothing is left running.
    fn acquire(&mut self, cancel: &CancelToken) -> Result<BackendHandle>;

    /// Copy the contents of `source` into the session's working directory.
    fn import_dataset(&mut self, handle: &BackendHandle, source: &Path, cancel: &CancelToken) -> Result<()>;

    /// Install `packages` and run `code` as `code.js`.
    fn execute(
        &mut self,
        handle: &BackendHandle,
        code: &str,
        packages: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult>;

    /// Copy the working directory's results into `output`.
    fn export_dataset(&mut self, handle: &BackendHandle, output: &Path, cancel: &CancelToken) -> Result<()>;

    /// Tear the session down. Runs on every exit path, including after an interrupt,
    /// so it does not take a cancel token.
    fn release(&mut self, handle: BackendHandle) -> Result<()>;
}
