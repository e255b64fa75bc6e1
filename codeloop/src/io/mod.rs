//! I/O side of the mission loop: config, processes, prompts, the oracle and
//! the execution backends.

pub mod backend;
pub mod config;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod terminal;
