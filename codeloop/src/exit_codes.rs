//! Process exit codes of the `codeloop` binary.

/// The mission finished, by completion or by exhausting its budget.
pub const OK: i32 = 0;
/// Invalid input, config, backend or oracle failure.
pub const FAILED: i32 = 1;
/// The user interrupted the run (128 + SIGINT).
pub const INTERRUPTED: i32 = 130;
