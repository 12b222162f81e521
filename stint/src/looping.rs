//! Multi-step driver for `stint run`.

use crate::core::types::{SessionId, SessionStatus};
use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;

/// Summary of a completed drive.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub status: SessionStatus,
    pub steps_executed: u32,
}

/// Call `advance` until the session is terminal, reporting every step.
///
/// Stops on the first error; the session is then aborted already when the
/// error was a storage failure.
pub fn run_to_completion<F: FnMut(&SessionStatus)>(
    orchestrator: &Orchestrator,
    session_id: SessionId,
    mut on_step: F,
) -> Result<LoopOutcome, OrchestratorError> {
    let mut status = orchestrator.status(session_id)?;
    let mut steps_executed = 0u32;
    while !status.state.is_terminal() {
        status = orchestrator.advance(session_id)?;
        steps_executed += 1;
        on_step(&status);
    }
    Ok(LoopOutcome {
        status,
        steps_executed,
    })
}
