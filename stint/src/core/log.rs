//! Persisted log entry format.
//!
//! One [`LogEntry`] is one JSON line in a session's log. Payloads are typed
//! through [`LogRecord`] on the way in and decoded leniently on the way out:
//! unknown fields are ignored and missing optional fields take defaults.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{Feature, SessionId, SessionState, ToolResult, ValidationResult};

/// Kind of a log entry, selecting the shape of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    PhaseTransition,
    ToolInvocation,
    ValidationResult,
    PlanningDecision,
    Abort,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PhaseTransition => "phase_transition",
            Self::ToolInvocation => "tool_invocation",
            Self::ValidationResult => "validation_result",
            Self::PlanningDecision => "planning_decision",
            Self::Abort => "abort",
        }
    }
}

/// One immutable entry of a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: SessionId,
    /// Contiguous from 1 within a session.
    pub sequence_number: u64,
    pub kind: LogKind,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Build an entry stamped with the current time.
    pub fn new(session_id: SessionId, sequence_number: u64, record: &LogRecord) -> Result<Self> {
        Ok(Self {
            session_id,
            sequence_number,
            kind: record.kind(),
            payload: record.payload()?,
            timestamp: Utc::now(),
        })
    }

    /// Decode the payload according to `kind`.
    pub fn record(&self) -> Result<LogRecord> {
        let payload = self.payload.clone();
        let record = match self.kind {
            LogKind::PhaseTransition => LogRecord::Transition(
                serde_json::from_value(payload).context("decode phase_transition payload")?,
            ),
            LogKind::ToolInvocation => LogRecord::ToolInvocation(
                serde_json::from_value(payload).context("decode tool_invocation payload")?,
            ),
            LogKind::ValidationResult => LogRecord::Validation(
                serde_json::from_value(payload).context("decode validation_result payload")?,
            ),
            LogKind::PlanningDecision => LogRecord::Planning(
                serde_json::from_value(payload).context("decode planning_decision payload")?,
            ),
            LogKind::Abort => LogRecord::Abort(
                serde_json::from_value(payload).context("decode abort payload")?,
            ),
        };
        Ok(record)
    }

    /// Feature recorded on a session's creation entry, if this is one.
    pub fn creation_feature(&self) -> Option<Feature> {
        if self.kind != LogKind::PhaseTransition {
            return None;
        }
        let payload: TransitionPayload = serde_json::from_value(self.payload.clone()).ok()?;
        payload.feature
    }

    /// Whether this entry moves its session into a terminal state.
    pub fn closes_session(&self) -> bool {
        match self.kind {
            LogKind::Abort => true,
            LogKind::PhaseTransition => self
                .payload
                .get("to")
                .and_then(|to| serde_json::from_value::<SessionState>(to.clone()).ok())
                .is_some_and(SessionState::is_terminal),
            _ => false,
        }
    }
}

/// Typed payload of a log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Transition(TransitionPayload),
    ToolInvocation(ToolResult),
    Validation(ValidationPayload),
    Planning(PlanningPayload),
    Abort(AbortPayload),
}

impl LogRecord {
    pub fn kind(&self) -> LogKind {
        match self {
            Self::Transition(_) => LogKind::PhaseTransition,
            Self::ToolInvocation(_) => LogKind::ToolInvocation,
            Self::Validation(_) => LogKind::ValidationResult,
            Self::Planning(_) => LogKind::PlanningDecision,
            Self::Abort(_) => LogKind::Abort,
        }
    }

    fn payload(&self) -> Result<Value> {
        let value = match self {
            Self::Transition(p) => serde_json::to_value(p),
            Self::ToolInvocation(p) => serde_json::to_value(p),
            Self::Validation(p) => serde_json::to_value(p),
            Self::Planning(p) => serde_json::to_value(p),
            Self::Abort(p) => serde_json::to_value(p),
        };
        value.with_context(|| format!("encode {} payload", self.kind().as_str()))
    }
}

/// Payload of a `phase_transition` entry.
///
/// The session's creation entry has `from = None` and carries the feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionPayload {
    #[serde(default)]
    pub from: Option<SessionState>,
    pub to: SessionState,
    /// Implementation attempt in effect after the transition.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<Feature>,
}

/// Payload of a `validation_result` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPayload {
    pub attempt: u32,
    #[serde(flatten)]
    pub result: ValidationResult,
}

/// Payload of a `planning_decision` entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanningPayload {
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<String>,
    /// Number of memory items the plan was made with.
    #[serde(default)]
    pub context_items: usize,
}

/// Payload of an `abort` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortPayload {
    pub from: SessionState,
    pub reason: String,
    #[serde(default)]
    pub flagged_for_inspection: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_serializes_as_flat_json_line() {
        let id = SessionId::generate();
        let record = LogRecord::Abort(AbortPayload {
            from: SessionState::Implementing,
            reason: "operator request".to_string(),
            flagged_for_inspection: false,
        });
        let entry = LogEntry::new(id, 4, &record).expect("entry");
        let line = serde_json::to_string(&entry).expect("serialize");
        assert!(!line.contains('\n'));

        let value: Value = serde_json::from_str(&line).expect("parse");
        assert_eq!(value["kind"], "abort");
        assert_eq!(value["sequence_number"], 4);
        assert_eq!(value["payload"]["from"], "implementing");
        assert_eq!(entry.record().expect("decode"), record);
    }

    #[test]
    fn payload_decoding_ignores_unknown_and_defaults_missing_fields() {
        let entry = LogEntry {
            session_id: SessionId::generate(),
            sequence_number: 2,
            kind: LogKind::PhaseTransition,
            payload: json!({"to": "implementing", "added_later": true}),
            timestamp: Utc::now(),
        };
        let LogRecord::Transition(payload) = entry.record().expect("decode") else {
            panic!("expected transition");
        };
        assert_eq!(payload.from, None);
        assert_eq!(payload.to, SessionState::Implementing);
        assert_eq!(payload.attempt, 0);
        assert!(entry.creation_feature().is_none());
    }

    #[test]
    fn validation_payload_flattens_result() {
        let payload = ValidationPayload {
            attempt: 2,
            result: ValidationResult {
                passed: false,
                elapsed_ms: 12,
                ..ValidationResult::default()
            },
        };
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["passed"], false);
        assert_eq!(value["elapsed_ms"], 12);
    }

    #[test]
    fn terminal_transitions_and_aborts_close_the_session() {
        let entry = |kind, payload| LogEntry {
            session_id: SessionId::generate(),
            sequence_number: 5,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        assert!(entry(LogKind::PhaseTransition, json!({"to": "failed"})).closes_session());
        assert!(entry(LogKind::Abort, json!({"from": "planning", "reason": "x"})).closes_session());
        assert!(!entry(LogKind::PhaseTransition, json!({"to": "iterating"})).closes_session());
        assert!(!entry(LogKind::ValidationResult, json!({"to": "succeeded"})).closes_session());
    }
}
