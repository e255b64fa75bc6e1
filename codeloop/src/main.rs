//! `codeloop`: let an oracle solve a data mission by writing and running
//! Node.js programs in an isolated backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use codeloop::cancel::Interrupted;
use codeloop::context::RunContext;
use codeloop::core::verdict::CompletionMatch;
use codeloop::exit_codes;
use codeloop::io::config::{
    BackendKind, DEFAULT_CONFIG_FILE, MissionConfig, load_config, write_config,
};
use codeloop::io::terminal::Terminal;
use codeloop::logging;
use codeloop::mission::{MissionRequest, MissionStop};
use codeloop::run::{abandon_session, run_mission};

#[derive(Parser)]
#[command(
    name = "codeloop",
    version,
    about = "Autonomous generate-execute-evaluate loop for data missions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Solve a mission against a data directory.
    ///
    /// Ctrl-C stops the run and releases the backend. A second Ctrl-C exits
    /// at once; container sessions are still removed, browser sessions may
    /// outlive the process.
    Run(RunArgs),
    /// Write a default config file.
    Init {
        /// Config file to create.
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
#[command(group(clap::ArgGroup::new("task").required(true).args(["mission", "mission_file"])))]
struct RunArgs {
    /// Mission text.
    #[arg(short, long)]
    mission: Option<String>,
    /// Read the mission from a file.
    #[arg(long)]
    mission_file: Option<PathBuf>,
    /// Directory with the input data.
    #[arg(short, long)]
    source: PathBuf,
    /// Directory that receives the results.
    #[arg(short, long)]
    output: PathBuf,
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
    /// Maximum rounds, 0 for unbounded.
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Container image (container backend).
    #[arg(long)]
    image: Option<String>,
    /// Working directory inside the container.
    #[arg(long)]
    workdir: Option<String>,
    /// Control page URL (page backend).
    #[arg(long)]
    page_url: Option<String>,
    /// Require the evaluator to answer with the bare completion token.
    #[arg(long)]
    strict_completion: bool,
    /// Hide spinners and round output.
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            if err.chain().any(|cause| cause.is::<Interrupted>()) {
                exit_codes::INTERRUPTED
            } else {
                exit_codes::FAILED
            }
        }
    };
    process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Init { config, force } => cmd_init(&config, force),
    }
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    apply_overrides(&mut cfg, &args);
    cfg.validate().context("invalid config")?;

    let mission = match (&args.mission, &args.mission_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read mission {}", path.display()))?
        }
        (None, None) => bail!("either --mission or --mission-file is required"),
    };
    let request = MissionRequest {
        mission: mission.trim().to_string(),
        source: args.source,
        output: args.output,
    };

    let ctx = RunContext::new(Terminal::new(!args.quiet));
    let handler_ctx = ctx.clone();
    ctrlc::set_handler(move || {
        // A second interrupt stops waiting for the run to unwind.
        if !handler_ctx.interrupt() {
            if !abandon_session(&handler_ctx) && let Some(session) = handler_ctx.live_session() {
                eprintln!("{} session {} may still be running", session.backend, session.id);
            }
            process::exit(exit_codes::INTERRUPTED);
        }
    })
    .context("install interrupt handler")?;

    let outcome = match run_mission(&cfg, &request, &ctx) {
        Ok(outcome) => outcome,
        Err(err) => {
            ctx.terminal.fail_active("failed");
            return Err(err);
        }
    };
    debug!(rounds = outcome.rounds, entries = outcome.log.len(), "mission finished");
    let summary = match outcome.stop {
        MissionStop::Completed => format!("Mission completed after {} round(s).", outcome.rounds),
        MissionStop::BudgetExhausted { max_iterations } => {
            format!("Stopped after reaching the limit of {max_iterations} round(s).")
        }
    };
    ctx.terminal.show_notice(&summary);
    Ok(())
}

fn apply_overrides(cfg: &mut MissionConfig, args: &RunArgs) {
    if let Some(kind) = args.backend {
        cfg.backend.kind = kind;
    }
    if let Some(max) = args.max_iterations {
        cfg.max_iterations = max;
    }
    if let Some(image) = &args.image {
        cfg.backend.container.image = image.clone();
    }
    if let Some(workdir) = &args.workdir {
        cfg.backend.container.workdir = workdir.clone();
    }
    if let Some(url) = &args.page_url {
        cfg.backend.page.url = url.clone();
    }
    if args.strict_completion {
        cfg.completion_match = CompletionMatch::Strict;
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &MissionConfig::default())
        .with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}
