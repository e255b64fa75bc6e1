//! User-facing progress output: spinners, plan, generated code, run output.
//!
//! This is product output, separate from `tracing` diagnostics. A hidden
//! terminal renders nothing, and the mission loop behaves identically.

use std::sync::Mutex;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::core::types::Plan;

/// Spinner and styled-text sink shared by the orchestrator and the interrupt
/// handler.
pub struct Terminal {
    visible: bool,
    active: Mutex<Vec<ProgressBar>>,
}

impl Terminal {
    pub fn new(visible: bool) -> Self {
        Self {
            visible,
            active: Mutex::new(Vec::new()),
        }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    /// Start a spinner tracked until it finishes.
    pub fn spinner(&self, message: impl Into<String>) -> Spinner {
        let bar = if self.visible {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.cyan} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(message.into());

        if let Ok(mut active) = self.active.lock() {
            active.retain(|bar| !bar.is_finished());
            active.push(bar.clone());
        }
        Spinner { bar }
    }

    /// Mark every spinner still running as failed.
    pub fn fail_active(&self, message: &str) {
        let Ok(mut active) = self.active.lock() else {
            return;
        };
        for bar in active.drain(..) {
            if !bar.is_finished() {
                bar.abandon_with_message(format!("{} {message}", style("✘").red()));
            }
        }
    }

    pub fn show_plan(&self, plan: &Plan) {
        if !self.visible {
            return;
        }
        if let Some(done) = plan.what_we_did.as_deref() {
            println!("{}", style(format!("📃 {done}")).cyan().bold());
        }
        println!("{}", style(format!("📌 {}", plan.what_to_do)).yellow().bold());
    }

    pub fn show_code(&self, code: &str) {
        if !self.visible {
            return;
        }
        let rule = style("─".repeat(60)).cyan();
        println!("{rule}");
        println!("{}", style("Generated Code").cyan().bold());
        println!("{rule}");
        println!("{code}");
        println!("{rule}");
    }

    pub fn show_output(&self, excerpt: &str) {
        if !self.visible {
            return;
        }
        println!();
        println!("{}", style(excerpt).yellow().bright());
        println!();
    }

    pub fn show_notice(&self, message: &str) {
        if self.visible {
            println!("{}", style(message).green());
        }
    }
}

/// Handle to a running spinner.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    pub fn succeed(self, message: impl AsRef<str>) {
        self.bar.finish_with_message(format!(
            "{} {}",
            style("✔").green(),
            message.as_ref()
        ));
    }

    /// No-op when the spinner was already failed by an interrupt.
    pub fn fail(self, message: impl AsRef<str>) {
        if self.bar.is_finished() {
            return;
        }
        self.bar
            .abandon_with_message(format!("{} {}", style("✘").red(), message.as_ref()));
    }
}
