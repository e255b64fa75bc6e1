//! Scripted oracle and backend for tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::cancel::{CancelToken, Interrupted};
use crate::core::types::Purpose;
use crate::io::backend::{BackendError, BackendHandle, ExecutionBackend, ExecutionResult};
use crate::io::oracle::{Oracle, OracleRequest};

enum Reply {
    Text(String),
    Fail(String),
}

/// Oracle answering from per-purpose queues, then per-purpose fallbacks.
///
/// Every request is recorded, including ones that fail.
#[derive(Default)]
pub struct ScriptedOracle {
    queues: RefCell<BTreeMap<Purpose, VecDeque<Reply>>>,
    fallbacks: BTreeMap<Purpose, String>,
    requests: RefCell<Vec<OracleRequest>>,
    cancel_on: Option<(Purpose, CancelToken)>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one answer for `purpose`.
    pub fn respond(self, purpose: Purpose, text: impl Into<String>) -> Self {
        self.push(purpose, Reply::Text(text.into()))
    }

    /// Queue one transport failure for `purpose`.
    pub fn fail(self, purpose: Purpose, message: impl Into<String>) -> Self {
        self.push(purpose, Reply::Fail(message.into()))
    }

    /// Answer used once the queue for `purpose` is empty.
    pub fn fallback(mut self, purpose: Purpose, text: impl Into<String>) -> Self {
        self.fallbacks.insert(purpose, text.into());
        self
    }

    /// Simulate a user interrupt arriving while waiting on `purpose`.
    pub fn cancel_on(mut self, purpose: Purpose, token: CancelToken) -> Self {
        self.cancel_on = Some((purpose, token));
        self
    }

    fn push(self, purpose: Purpose, reply: Reply) -> Self {
        self.queues
            .borrow_mut()
            .entry(purpose)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.borrow().clone()
    }

    pub fn purposes(&self) -> Vec<Purpose> {
        self.requests.borrow().iter().map(|r| r.purpose).collect()
    }

    pub fn count(&self, purpose: Purpose) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.purpose == purpose)
            .count()
    }
}

impl Oracle for ScriptedOracle {
    fn chat_completion(&self, request: &OracleRequest, cancel: &CancelToken) -> Result<String> {
        cancel.check()?;
        self.requests.borrow_mut().push(request.clone());

        if let Some((purpose, token)) = &self.cancel_on
            && *purpose == request.purpose
        {
            token.cancel();
            return Err(Interrupted.into());
        }

        let queued = self
            .queues
            .borrow_mut()
            .get_mut(&request.purpose)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(anyhow!(message)),
            None => self
                .fallbacks
                .get(&request.purpose)
                .cloned()
                .ok_or_else(|| anyhow!("no scripted response for {}", request.purpose)),
        }
    }
}

/// Number of calls made to each [`ScriptedBackend`] operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCalls {
    pub acquire: usize,
    pub import: usize,
    pub execute: usize,
    pub export: usize,
    pub release: usize,
}

/// A program handed to [`ScriptedBackend::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedProgram {
    pub code: String,
    pub packages: BTreeSet<String>,
}

/// In-memory backend with scripted outputs and injectable failures.
#[derive(Default)]
pub struct ScriptedBackend {
    outputs: VecDeque<String>,
    default_output: String,
    fail_acquire: bool,
    fail_import: bool,
    fail_export: bool,
    fail_execute_on: Option<usize>,
    cancel_on_execute: Option<(usize, CancelToken)>,
    export_files: Vec<(String, String)>,
    live: Option<String>,
    calls: BackendCalls,
    imported: Vec<String>,
    executed: Vec<ExecutedProgram>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output for every run without a queued output.
    pub fn output(mut self, text: impl Into<String>) -> Self {
        self.default_output = text.into();
        self
    }

    /// Queue outputs for successive runs.
    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    pub fn fail_acquire(mut self) -> Self {
        self.fail_acquire = true;
        self
    }

    pub fn fail_import(mut self) -> Self {
        self.fail_import = true;
        self
    }

    pub fn fail_export(mut self) -> Self {
        self.fail_export = true;
        self
    }

    /// Fail the `run`-th call to `execute` (1-indexed).
    pub fn fail_execute_on(mut self, run: usize) -> Self {
        self.fail_execute_on = Some(run);
        self
    }

    /// Simulate a user interrupt arriving during the `run`-th execution.
    pub fn cancel_on_execute(mut self, run: usize, token: CancelToken) -> Self {
        self.cancel_on_execute = Some((run, token));
        self
    }

    /// File written into the output directory on export.
    pub fn export_file(mut self, rel: impl Into<String>, contents: impl Into<String>) -> Self {
        self.export_files.push((rel.into(), contents.into()));
        self
    }

    pub fn calls(&self) -> BackendCalls {
        self.calls
    }

    /// File names found in imported source directories.
    pub fn imported(&self) -> &[String] {
        &self.imported
    }

    pub fn executed(&self) -> &[ExecutedProgram] {
        &self.executed
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    fn check_handle(&self, handle: &BackendHandle) -> Result<()> {
        match &self.live {
            Some(id) if id == handle.id() => Ok(()),
            _ => Err(BackendError::NotAcquired.into()),
        }
    }
}

impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn acquire(&mut self, cancel: &CancelToken) -> Result<BackendHandle> {
        cancel.check()?;
        self.calls.acquire += 1;
        if self.fail_acquire {
            return Err(BackendError::EngineNotRunning.into());
        }
        let id = format!("scripted-{}", self.calls.acquire);
        self.live = Some(id.clone());
        Ok(BackendHandle::new(id))
    }

    fn import_dataset(&mut self, handle: &BackendHandle, source: &Path, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.check_handle(handle)?;
        self.calls.import += 1;
        if self.fail_import {
            return Err(anyhow!("scripted import failure"));
        }
        for entry in fs::read_dir(source).with_context(|| format!("read {}", source.display()))? {
            let entry = entry.context("read source entry")?;
            self.imported
                .push(entry.file_name().to_string_lossy().into_owned());
        }
        self.imported.sort();
        Ok(())
    }

    fn execute(
        &mut self,
        handle: &BackendHandle,
        code: &str,
        packages: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult> {
        cancel.check()?;
        self.check_handle(handle)?;
        self.calls.execute += 1;
        let run = self.calls.execute;
        self.executed.push(ExecutedProgram {
            code: code.to_string(),
            packages: packages.clone(),
        });

        if let Some((at, token)) = &self.cancel_on_execute
            && *at == run
        {
            token.cancel();
            return Err(Interrupted.into());
        }
        if self.fail_execute_on == Some(run) {
            return Err(anyhow!("scripted execution failure in run {run}"));
        }

        let output = self
            .outputs
            .pop_front()
            .unwrap_or_else(|| self.default_output.clone());
        Ok(ExecutionResult {
            output,
            exit_code: Some(0),
            timed_out: false,
        })
    }

    fn export_dataset(&mut self, handle: &BackendHandle, output: &Path, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.check_handle(handle)?;
        self.calls.export += 1;
        if self.fail_export {
            return Err(anyhow!("scripted export failure"));
        }
        fs::create_dir_all(output).with_context(|| format!("create {}", output.display()))?;
        for (rel, contents) in &self.export_files {
            let dest = output.join(rel);
            fs::write(&dest, contents).with_context(|| format!("write {}", dest.display()))?;
        }
        Ok(())
    }

    fn release(&mut self, handle: BackendHandle) -> Result<()> {
        self.calls.release += 1;
        self.check_handle(&handle)?;
        self.live = None;
        Ok(())
    }
}
