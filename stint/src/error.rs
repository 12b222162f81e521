//! Typed errors callers branch on.
//!
//! Plumbing inside I/O adapters stays on `anyhow`; these enums mark the points
//! where a caller must tell one failure apart from another.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::{Feature, SessionId, SessionState};

/// Errors surfaced by the session orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The request is not a single boundable feature. No session was created.
    #[error("feature request rejected: {reason}")]
    ScopeRejected {
        reason: String,
        /// Proposed single-feature parts, when the guard could split the request.
        split: Vec<Feature>,
    },

    #[error("session {session_id} is {state} and accepts no further transitions")]
    InvalidTransition {
        session_id: SessionId,
        state: SessionState,
    },

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// Durable memory for the session could not be written or read. The
    /// session has been aborted and flagged for inspection where possible.
    #[error("storage failure for session {session_id}")]
    Storage {
        session_id: SessionId,
        #[source]
        source: StoreError,
    },
}

/// Errors from the log store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sequence conflict for session {session_id}: expected {expected}, got {actual}")]
    SequenceConflict {
        session_id: SessionId,
        expected: u64,
        actual: u64,
    },

    #[error("log store i/o on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt log data at {location}: {message}")]
    Corrupt { location: String, message: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the tool execution gateway.
///
/// Every variant is raised only after the invocation has been logged, except
/// `Storage`, which means logging itself failed.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Fatal to the session; never retried.
    #[error("sandbox violation by {tool}: {detail}")]
    SandboxViolation { tool: String, detail: String },

    #[error(transparent)]
    Storage(#[from] StoreError),
}
