//! `codeloop run`: wire the configured oracle and backend into a mission.

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::context::RunContext;
use crate::io::backend::container::remove_container;
use crate::io::backend::{ContainerRuntime, ExecutionBackend, SandboxedPage};
use crate::io::config::{BackendKind, MissionConfig};
use crate::io::oracle::HttpOracle;
use crate::mission::{MissionOutcome, MissionRequest, MissionSettings, Orchestrator};

/// Construct the backend selected in config. Nothing is started yet.
pub fn build_backend(cfg: &MissionConfig) -> Result<Box<dyn ExecutionBackend>> {
    Ok(match cfg.backend.kind {
        BackendKind::Container => Box::new(ContainerRuntime::new(cfg.backend.container.clone())),
        BackendKind::Page => Box::new(SandboxedPage::new(cfg.backend.page.clone())?),
    })
}

#[instrument(skip_all, fields(backend = ?cfg.backend.kind, model = %cfg.oracle.model))]
pub fn run_mission(cfg: &MissionConfig, request: &MissionRequest, ctx: &RunContext) -> Result<MissionOutcome> {
    cfg.validate().context("invalid config")?;
    let oracle = HttpOracle::from_config(&cfg.oracle)?;
    let mut backend = build_backend(cfg)?;
    info!(backend = backend.name(), "starting mission");
    Orchestrator::new(&oracle, MissionSettings::from_config(cfg), ctx)?.run(request, backend.as_mut())
}

/// Best-effort cleanup for a process about to exit without releasing its
/// backend. Returns whether a session was removed.
///
/// Only container sessions can be removed from outside the run.
pub fn abandon_session(ctx: &RunContext) -> bool {
    let Some(session) = ctx.live_session() else {
        return false;
    };
    if session.backend != ContainerRuntime::NAME {
        warn!(backend = session.backend, session = %session.id, "session is left to end with the process");
        return false;
    }
    match remove_container(&session.id) {
        Ok(()) => {
            ctx.set_live_session(None);
            true
        }
        Err(err) => {
            warn!(container = %session.id, err = %format!("{err:#}"), "could not remove container");
            false
        }
    }
}
