//! The mission loop: plan, generate, execute, record and evaluate until the
//! oracle declares completion or the iteration budget runs out.
//!
//! The execution backend is held by a [`BackendLease`] for the whole run, so
//! every exit path (success, error, interrupt) releases the session exactly
//! once.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::agents::{CodeGenerator, Evaluator, Planner};
use crate::cancel::CancelToken;
use crate::context::{LiveSession, RunContext};
use crate::core::budget::IterationBudget;
use crate::core::excerpt::{strip_ansi, truncate_excerpt};
use crate::core::transaction::TransactionLog;
use crate::core::verdict::CompletionMatch;
use crate::io::backend::{BackendError, BackendHandle, ExecutionBackend, ExecutionResult};
use crate::io::config::MissionConfig;
use crate::io::oracle::Oracle;
use crate::io::prompt::PromptBuilder;

/// What to do and where the data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissionRequest {
    pub mission: String,
    /// Directory whose contents are copied into the backend before round 1.
    pub source: PathBuf,
    /// Directory that receives the backend's working directory at the end.
    pub output: PathBuf,
}

impl MissionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.mission.trim().is_empty() {
            return Err(anyhow!("mission must be non-empty"));
        }
        if !self.source.is_dir() {
            return Err(anyhow!(
                "data source {} is not a directory",
                self.source.display()
            ));
        }
        if self.output.as_os_str().is_empty() {
            return Err(anyhow!("data output path must be non-empty"));
        }
        Ok(())
    }
}

/// Loop policy derived from config and CLI overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionSettings {
    pub budget: IterationBudget,
    pub completion: CompletionMatch,
    pub ask_for_packages: bool,
}

impl MissionSettings {
    pub fn from_config(cfg: &MissionConfig) -> Self {
        Self {
            budget: IterationBudget::new(cfg.max_iterations),
            completion: cfg.completion_match,
            ask_for_packages: cfg.packages.ask_oracle,
        }
    }
}

impl Default for MissionSettings {
    fn default() -> Self {
        Self::from_config(&MissionConfig::default())
    }
}

/// Step of the mission state machine, used in error context and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    AcquireBackend,
    ImportDataset,
    Plan,
    Generate,
    Execute,
    Record,
    Evaluate,
    ExportDataset,
    ReleaseBackend,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::AcquireBackend => "acquire backend",
            Phase::ImportDataset => "import dataset",
            Phase::Plan => "plan",
            Phase::Generate => "generate",
            Phase::Execute => "execute",
            Phase::Record => "record",
            Phase::Evaluate => "evaluate",
            Phase::ExportDataset => "export dataset",
            Phase::ReleaseBackend => "release backend",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionStop {
    /// The evaluator declared the mission complete.
    Completed,
    /// Every allowed round ran without completion.
    BudgetExhausted { max_iterations: u32 },
}

/// Summary of a finished mission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissionOutcome {
    pub rounds: u32,
    pub stop: MissionStop,
    pub log: TransactionLog,
}

/// Scoped owner of an acquired backend session.
///
/// [`BackendLease::release`] ends the session on the normal path; dropping an
/// unreleased lease (error or interrupt) releases it from `Drop`. While the
/// lease holds a session it is published as the context's live session.
pub struct BackendLease<'b> {
    backend: &'b mut dyn ExecutionBackend,
    handle: Option<BackendHandle>,
    ctx: RunContext,
}

impl<'b> BackendLease<'b> {
    pub fn acquire(backend: &'b mut dyn ExecutionBackend, ctx: &RunContext) -> Result<Self> {
        ctx.cancel.check()?;
        let handle = backend.acquire(&ctx.cancel)?;
        info!(backend = backend.name(), session = %handle, "backend acquired");
        ctx.set_live_session(Some(LiveSession {
            backend: backend.name(),
            id: handle.id().to_string(),
        }));
        Ok(Self {
            backend,
            handle: Some(handle),
            ctx: ctx.clone(),
        })
    }

    pub fn import_dataset(&mut self, source: &Path, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let handle = self.handle.as_ref().ok_or(BackendError::NotAcquired)?;
        self.backend.import_dataset(handle, source, cancel)
    }

    pub fn execute(
        &mut self,
        code: &str,
        packages: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult> {
        cancel.check()?;
        let handle = self.handle.as_ref().ok_or(BackendError::NotAcquired)?;
        self.backend.execute(handle, code, packages, cancel)
    }

    pub fn export_dataset(&mut self, output: &Path, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let handle = self.handle.as_ref().ok_or(BackendError::NotAcquired)?;
        self.backend.export_dataset(handle, output, cancel)
    }

    pub fn release(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let released = self.backend.release(handle);
        self.ctx.set_live_session(None);
        released
    }
}

impl Drop for BackendLease<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(session = %handle, "releasing backend from drop");
            if let Err(err) = self.backend.release(handle) {
                warn!(err = %format!("{err:#}"), "backend release failed");
            }
            self.ctx.set_live_session(None);
        }
    }
}

fn in_round(round: u32, phase: Phase) -> String {
    format!("round {round}: {phase}")
}

/// Drives one mission against one oracle and one backend.
pub struct Orchestrator<'a, O: Oracle + ?Sized> {
    oracle: &'a O,
    prompts: PromptBuilder,
    settings: MissionSettings,
    ctx: &'a RunContext,
}

impl<'a, O: Oracle + ?Sized> Orchestrator<'a, O> {
    pub fn new(oracle: &'a O, settings: MissionSettings, ctx: &'a RunContext) -> Result<Self> {
        Ok(Self {
            oracle,
            prompts: PromptBuilder::new()?,
            settings,
            ctx,
        })
    }

    /// Run `f` under a spinner that succeeds or fails with it.
    fn step<T>(&self, working: &str, done: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let spinner = self.ctx.terminal.spinner(working);
        match f() {
            Ok(value) => {
                spinner.succeed(done);
                Ok(value)
            }
            Err(err) => {
                spinner.fail(working);
                Err(err)
            }
        }
    }

    #[instrument(skip_all, fields(backend = backend.name(), budget = ?self.settings.budget.limit()))]
    pub fn run(
        &self,
        request: &MissionRequest,
        backend: &mut dyn ExecutionBackend,
    ) -> Result<MissionOutcome> {
        let cancel = &self.ctx.cancel;
        let terminal = &self.ctx.terminal;
        cancel.check()?;
        request.validate().context(Phase::Init)?;

        let planner = Planner::new(&self.prompts);
        let coder = CodeGenerator::new(&self.prompts, self.settings.ask_for_packages)
            .context(Phase::Init)?;
        let evaluator = Evaluator::new(&self.prompts, self.settings.completion);

        let mut lease = self
            .step("Starting the execution backend...", "Execution backend ready.", || {
                BackendLease::acquire(backend, self.ctx)
            })
            .context(Phase::AcquireBackend)?;

        self.step("Importing data...", "Data imported.", || {
            lease.import_dataset(&request.source, cancel)
        })
        .context(Phase::ImportDataset)?;

        let mut log = TransactionLog::new();
        let mut round = 0u32;
        let stop = loop {
            let next = round + 1;
            if !self.settings.budget.allows(next) {
                let max_iterations = self.settings.budget.limit().unwrap_or(round);
                info!(rounds = round, max_iterations, "iteration budget exhausted");
                break MissionStop::BudgetExhausted { max_iterations };
            }
            round = next;
            log.seed_if_empty();

            debug!(round, phase = %Phase::Plan, "entering phase");
            let plan = self
                .step("Planning the next step...", "Plan ready.", || {
                    planner.plan_next(self.oracle, &log, &request.mission, cancel)
                })
                .with_context(|| in_round(round, Phase::Plan))?;
            terminal.show_plan(&plan);

            debug!(round, phase = %Phase::Generate, "entering phase");
            let generated = self
                .step("Generating code...", "Code generated.", || {
                    coder.generate(self.oracle, &log, &request.mission, &plan, cancel)
                })
                .with_context(|| in_round(round, Phase::Generate))?;
            terminal.show_code(&generated.code);

            debug!(round, phase = %Phase::Execute, "entering phase");
            let result = self
                .step(
                    "Running code...",
                    &format!("Run #{round} finished."),
                    || lease.execute(&generated.code, &generated.packages, cancel),
                )
                .with_context(|| in_round(round, Phase::Execute))?;
            if result.timed_out || result.exit_code.is_some_and(|code| code != 0) {
                warn!(round, exit_code = ?result.exit_code, timed_out = result.timed_out, "program did not exit cleanly");
            }
            let output = strip_ansi(&result.output).into_owned();
            terminal.show_output(&truncate_excerpt(&output));

            debug!(round, phase = %Phase::Record, "entering phase");
            log.record_round(generated.code, output);

            debug!(round, phase = %Phase::Evaluate, "entering phase");
            let complete = self
                .step("Checking whether the mission is complete...", "Evaluation done.", || {
                    evaluator.is_mission_complete(self.oracle, &log, &request.mission, cancel)
                })
                .with_context(|| in_round(round, Phase::Evaluate))?;
            if complete {
                info!(round, "mission complete");
                break MissionStop::Completed;
            }
        };

        self.step("Saving results...", "Results saved.", || {
            lease.export_dataset(&request.output, cancel)
        })
        .context(Phase::ExportDataset)?;

        self.step("Cleaning up...", "Cleanup done.", || lease.release())
            .context(Phase::ReleaseBackend)?;
        terminal.show_notice(&format!("Results saved to {}", request.output.display()));

        Ok(MissionOutcome {
            rounds: round,
            stop,
            log,
        })
    }
}
