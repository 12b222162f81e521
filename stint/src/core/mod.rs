//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod cancel;
pub mod diagnostics;
pub mod log;
pub mod path;
pub mod relevance;
pub mod scope;
pub mod session;
pub mod symbols;
pub mod types;
