//! Autonomous generate-execute-evaluate loop for data missions.
//!
//! Given a natural-language mission, an oracle plans the next step, writes a
//! Node.js program for it, the program runs in an isolated backend, and the
//! oracle judges whether the mission is complete.
//!
//! - **[`core`]**: pure logic (transaction log, truncation, sanitizing,
//!   completion protocol, budget).
//! - **[`io`]**: side effects (config, processes, prompts, oracle, backends,
//!   terminal output).
//! - **[`agents`]**: planner, code generator and evaluator.
//!
//! [`mission`] runs the state machine; [`run`] wires config into it.

pub mod agents;
pub mod cancel;
pub mod context;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod mission;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
