//! Single-feature session orchestration for an agentic coding assistant.
//!
//! A session takes one feature request through planning, implementation,
//! validation and bounded iteration, recording every step in a durable
//! per-session log that later sessions recall as memory. The crate keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, log records, scope
//!   and relevance heuristics, diagnostics parsing). No I/O.
//! - **[`io`]**: Side-effecting adapters (log store, process execution, tools,
//!   validation checks, model backend). Behind traits so tests can substitute them.
//!
//! [`orchestrator`] coordinates the two; [`context_loader`] turns past logs into
//! bounded memory; [`looping`] drives a session to a terminal state.

pub mod context_loader;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
