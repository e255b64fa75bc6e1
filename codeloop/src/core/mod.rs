//! Deterministic, pure logic shared by the mission loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod excerpt;
pub mod sanitize;
pub mod transaction;
pub mod types;
pub mod verdict;
