//! Shared deterministic types for session orchestration.
//!
//! These types define stable contracts between the orchestrator and its
//! collaborators. They carry no I/O and serialize to the persisted log format,
//! so field changes must stay additive.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of one session (one bounded unit of work on one feature).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Planning,
    Implementing,
    Validating,
    Iterating,
    Succeeded,
    Failed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Implementing => "implementing",
            Self::Validating => "validating",
            Self::Iterating => "iterating",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a session, `Pending` until a terminal state is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed,
    Aborted,
}

impl From<SessionState> for Outcome {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Succeeded => Self::Succeeded,
            SessionState::Failed => Self::Failed,
            SessionState::Aborted => Self::Aborted,
            _ => Self::Pending,
        }
    }
}

/// The unit of scope: a short description plus an explicit boundary.
///
/// A request for work is a `Feature` the scope guard has not approved yet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Feature {
    pub description: String,
    /// What the change must cover.
    #[serde(default)]
    pub includes: Vec<String>,
    /// What the change must leave alone.
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Free-form labels used for cross-session memory retrieval.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Feature {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_include(mut self, item: impl Into<String>) -> Self {
        self.includes.push(item.into());
        self
    }

    pub fn with_exclude(mut self, item: impl Into<String>) -> Self {
        self.excludes.push(item.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Plan produced during `Planning` for the session's single feature.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

/// One tool call requested by the model during `Implementing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// One finding reported by a validation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Name of the check that produced it.
    pub check: String,
    /// Location hint (`path:line:col`, a test name, or the check name).
    pub location: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.check, self.location, self.message)
    }
}

/// Per-check summary inside a [`ValidationResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Outcome of one validation run over an implementation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub checks: Vec<CheckSummary>,
    pub elapsed_ms: u64,
    /// Set when the run stopped early because the session was cancelled.
    #[serde(default)]
    pub cancelled: bool,
}

/// Classification of a finished tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Succeeded,
    Failed,
    TimedOut,
    NotFound,
    SandboxViolation,
}

/// Captured result of one tool invocation. A retry is a new invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: Uuid,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    pub outcome: ToolOutcome,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
    /// Human-readable explanation for non-successful outcomes.
    #[serde(default)]
    pub detail: Option<String>,
}

impl ToolResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == ToolOutcome::Succeeded
    }
}

/// Read-only view of a session exposed to callers (CLI, services).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub state: SessionState,
    pub outcome: Outcome,
    pub retry_count: u32,
    /// Implementation attempts started so far.
    pub attempts: u32,
    pub last_diagnostics: Vec<Diagnostic>,
    /// Why the session reached its terminal state, when known.
    pub terminal_reason: Option<String>,
    /// Set when durable memory for this session may be inconsistent.
    pub flagged_for_inspection: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_map_to_outcomes() {
        assert_eq!(Outcome::from(SessionState::Succeeded), Outcome::Succeeded);
        assert_eq!(Outcome::from(SessionState::Failed), Outcome::Failed);
        assert_eq!(Outcome::from(SessionState::Aborted), Outcome::Aborted);
        assert_eq!(Outcome::from(SessionState::Iterating), Outcome::Pending);
        assert!(SessionState::Aborted.is_terminal());
        assert!(!SessionState::Validating.is_terminal());
    }

    #[test]
    fn session_id_parses_its_display_form() {
        let id = SessionId::generate();
        let parsed: SessionId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
        assert!("not-a-session".parse::<SessionId>().is_err());
    }

    #[test]
    fn feature_deserializes_without_boundary_fields() {
        let feature: Feature =
            serde_json::from_str(r#"{"description":"add retry jitter"}"#).expect("parse");
        assert_eq!(feature, Feature::new("add retry jitter"));
    }
}
