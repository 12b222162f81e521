//! Session state machine.
//!
//! Mutation is split in two so the orchestrator can log before it changes
//! anything: `plan_*` validates a move and produces the payload to persist,
//! `apply_*` folds a persisted payload into the in-memory session. Rebuilding a
//! session from its log is the same fold over every entry.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::log::{
    AbortPayload, LogEntry, LogRecord, PlanningPayload, TransitionPayload, ValidationPayload,
};
use crate::core::types::{Diagnostic, Feature, Outcome, Plan, SessionId, SessionState, SessionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("session is terminal ({0})")]
    Terminal(SessionState),
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: SessionState, to: SessionState },
}

/// True when `from -> to` is an edge of the state machine, excluding aborts.
pub fn is_legal(from: SessionState, to: SessionState) -> bool {
    use SessionState::{Failed, Implementing, Iterating, Planning, Succeeded, Validating};
    matches!(
        (from, to),
        (Planning, Implementing)
            | (Implementing, Validating)
            | (Validating, Succeeded | Iterating | Failed)
            | (Iterating, Implementing | Failed)
    )
}

/// In-memory state of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub feature: Feature,
    pub created_at: DateTime<Utc>,
    state: SessionState,
    transitions: Vec<TransitionPayload>,
    retry_count: u32,
    attempt: u32,
    plan: Option<Plan>,
    guidance: Option<String>,
    last_diagnostics: Vec<Diagnostic>,
    flagged_for_inspection: bool,
    terminal_reason: Option<String>,
}

impl Session {
    /// Payload of the creation entry for a new session.
    pub fn creation(feature: &Feature) -> TransitionPayload {
        TransitionPayload {
            from: None,
            to: SessionState::Planning,
            attempt: 0,
            reason: Some("session created".to_string()),
            feature: Some(feature.clone()),
        }
    }

    pub fn new(id: SessionId, feature: Feature, created_at: DateTime<Utc>) -> Self {
        let creation = Self::creation(&feature);
        Self {
            id,
            feature,
            created_at,
            state: SessionState::Planning,
            transitions: vec![creation],
            retry_count: 0,
            attempt: 0,
            plan: None,
            guidance: None,
            last_diagnostics: Vec::new(),
            flagged_for_inspection: false,
            terminal_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Retry guidance carried into the current attempt.
    pub fn guidance(&self) -> Option<&str> {
        self.guidance.as_deref()
    }

    pub fn last_diagnostics(&self) -> &[Diagnostic] {
        &self.last_diagnostics
    }

    pub fn transitions(&self) -> &[TransitionPayload] {
        &self.transitions
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Validate `state -> to` and build the entry that records it.
    pub fn plan_transition(
        &self,
        to: SessionState,
        reason: Option<String>,
    ) -> Result<TransitionPayload, TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal(self.state));
        }
        if !is_legal(self.state, to) {
            return Err(TransitionError::Illegal {
                from: self.state,
                to,
            });
        }
        let attempt = if to == SessionState::Implementing {
            self.attempt + 1
        } else {
            self.attempt
        };
        Ok(TransitionPayload {
            from: Some(self.state),
            to,
            attempt,
            reason,
            feature: None,
        })
    }

    pub fn apply_transition(&mut self, payload: &TransitionPayload) {
        if payload.to == SessionState::Implementing {
            if payload.from == Some(SessionState::Iterating) {
                self.retry_count += 1;
                self.guidance = payload.reason.clone();
            }
            self.attempt = payload.attempt;
        }
        if payload.to.is_terminal() {
            self.terminal_reason = payload.reason.clone();
        }
        self.state = payload.to;
        self.transitions.push(payload.clone());
    }

    pub fn plan_abort(
        &self,
        reason: impl Into<String>,
        flagged_for_inspection: bool,
    ) -> Result<AbortPayload, TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal(self.state));
        }
        Ok(AbortPayload {
            from: self.state,
            reason: reason.into(),
            flagged_for_inspection,
        })
    }

    pub fn apply_abort(&mut self, payload: &AbortPayload) {
        self.state = SessionState::Aborted;
        self.terminal_reason = Some(payload.reason.clone());
        self.flagged_for_inspection |= payload.flagged_for_inspection;
        self.transitions.push(TransitionPayload {
            from: Some(payload.from),
            to: SessionState::Aborted,
            attempt: self.attempt,
            reason: Some(payload.reason.clone()),
            feature: None,
        });
    }

    pub fn apply_planning(&mut self, payload: &PlanningPayload) {
        self.plan = Some(Plan {
            summary: payload.summary.clone(),
            steps: payload.steps.clone(),
        });
    }

    pub fn apply_validation(&mut self, payload: &ValidationPayload) {
        self.last_diagnostics = payload.result.diagnostics.clone();
    }

    /// Mark the session as needing manual inspection without logging.
    ///
    /// Used when the log itself could not be written.
    pub fn flag_for_inspection(&mut self, reason: impl Into<String>) {
        self.flagged_for_inspection = true;
        if !self.state.is_terminal() {
            self.state = SessionState::Aborted;
            self.terminal_reason = Some(reason.into());
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id,
            state: self.state,
            outcome: Outcome::from(self.state),
            retry_count: self.retry_count,
            attempts: self.attempt,
            last_diagnostics: self.last_diagnostics.clone(),
            terminal_reason: self.terminal_reason.clone(),
            flagged_for_inspection: self.flagged_for_inspection,
        }
    }

    /// Rebuild a session by folding its log entries in sequence order.
    pub fn rehydrate<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let mut entries = entries.into_iter();
        let first = entries
            .next()
            .ok_or_else(|| anyhow!("session log is empty"))?;
        let feature = first
            .creation_feature()
            .ok_or_else(|| anyhow!("first entry is not a session creation"))?;
        let mut session = Self::new(first.session_id, feature, first.timestamp);

        for entry in entries {
            if entry.session_id != session.id {
                return Err(anyhow!(
                    "entry {} belongs to session {}",
                    entry.sequence_number,
                    entry.session_id
                ));
            }
            match entry.record()? {
                LogRecord::Transition(payload) => session.apply_transition(&payload),
                LogRecord::Abort(payload) => session.apply_abort(&payload),
                LogRecord::Planning(payload) => session.apply_planning(&payload),
                LogRecord::Validation(payload) => session.apply_validation(&payload),
                LogRecord::ToolInvocation(_) => {}
            }
        }
        Ok(session)
    }
}
