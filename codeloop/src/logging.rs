//! Diagnostics for debugging the mission loop.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. Spinners, plans,
//! generated code and program output are product output and go through
//! `io::terminal` instead.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=codeloop=debug codeloop run --mission "..." --source data --output out
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
