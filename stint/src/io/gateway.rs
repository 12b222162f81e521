//! Tool execution gateway.
//!
//! Every tool call goes through [`Gateway::invoke`]: the tool declares what it
//! is about to touch, the [`SandboxPolicy`] is checked, the tool runs on a
//! worker thread under the policy timeout and the session's cancel signal, and
//! the captured [`ToolResult`] is appended to the session log before `invoke`
//! returns, whatever the outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::budget::bounded_timeout;
use crate::core::cancel::CancelToken;
use crate::core::log::LogRecord;
use crate::core::path::{normalize, within_roots};
use crate::core::types::{ToolOutcome, ToolResult};
use crate::error::GatewayError;
use crate::io::journal::SessionJournal;

const POLL: Duration = Duration::from_millis(50);
/// Time a tool gets to stop after its timeout or a cancel before it is abandoned.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Limits a tool call must stay within.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    /// Absolute roots; every filesystem access must fall inside one of them.
    pub allowed_roots: Vec<PathBuf>,
    pub allow_network: bool,
    /// Wall-clock limit for one invocation.
    pub timeout: Duration,
    /// Captured stdout/stderr beyond this many bytes is dropped.
    pub max_output_bytes: usize,
    /// Largest file a tool may leave behind.
    pub max_file_bytes: u64,
}

impl SandboxPolicy {
    /// Check one declared access. `Err` carries the violation detail.
    pub fn permits(&self, access: &Access) -> Result<(), String> {
        match access {
            Access::Read(path) => self.check_path(path, "read"),
            Access::Write { path, bytes } => {
                self.check_path(path, "write")?;
                if *bytes > self.max_file_bytes {
                    return Err(format!(
                        "write of {bytes} bytes to {} exceeds max_file_bytes {}",
                        path.display(),
                        self.max_file_bytes
                    ));
                }
                Ok(())
            }
            Access::Execute { cwd } => self.check_path(cwd, "execute in"),
            Access::Network(target) => {
                if self.allow_network {
                    Ok(())
                } else {
                    Err(format!("network access to {target} is not allowed"))
                }
            }
        }
    }

    fn check_path(&self, path: &Path, verb: &str) -> Result<(), String> {
        let lexical = normalize(Path::new("/"), path);
        if !within_roots(&lexical, &self.allowed_roots) {
            return Err(format!("{verb} {} is outside allowed roots", path.display()));
        }
        // Symlinks inside a root may still point elsewhere.
        let real = real_path(&lexical);
        let real_roots: Vec<PathBuf> = self.allowed_roots.iter().map(|r| real_path(r)).collect();
        if !within_roots(&real, &real_roots) {
            return Err(format!(
                "{verb} {} resolves to {} outside allowed roots",
                path.display(),
                real.display()
            ));
        }
        Ok(())
    }
}

/// Canonicalize the longest existing prefix of `path` and re-attach the rest.
fn real_path(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(real) = existing.canonicalize() {
            let mut out = real;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// A resource a tool call will touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Read(PathBuf),
    Write { path: PathBuf, bytes: u64 },
    Execute { cwd: PathBuf },
    Network(String),
}

/// Raised by a tool that detects a policy breach while running.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SandboxBreach(pub String);

/// What a tool sees while running.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workdir: PathBuf,
    pub policy: SandboxPolicy,
    /// Effective timeout for this invocation (policy timeout bounded by the attempt budget).
    pub timeout: Duration,
    /// Fires on session abort or timeout; long-running tools must observe it.
    pub cancel: CancelToken,
}

impl ToolContext {
    /// Resolve a tool argument path against the workspace.
    pub fn resolve(&self, path: &str) -> PathBuf {
        normalize(&self.workdir, Path::new(path))
    }
}

/// Raw result of running a tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolRun {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ToolRun {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            ..Self::default()
        }
    }
}

/// A capability the model can call during implementation.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Resources the call would touch; checked before `run`. An `Err` means the
    /// arguments are unusable and the call is recorded as failed.
    fn access(&self, arguments: &Value, ctx: &ToolContext) -> Result<Vec<Access>>;
    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun>;
}

/// Name and description advertised to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool`, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) -> &mut Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
            })
            .collect()
    }
}

/// Per-call session state handed to the gateway.
pub struct InvocationContext<'a> {
    pub journal: &'a mut SessionJournal,
    pub cancel: &'a CancelToken,
    /// End of the current attempt's wall-clock budget.
    pub deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct Gateway {
    registry: ToolRegistry,
    workdir: PathBuf,
}

impl Gateway {
    pub fn new(registry: ToolRegistry, workdir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            workdir: workdir.into(),
        }
    }

    pub fn tools(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    /// Run one tool call under `policy` and log it.
    ///
    /// Timeouts, non-zero exits and bad arguments are `Ok` results with the
    /// matching outcome. `ToolNotFound` and `SandboxViolation` are errors, but
    /// are logged first like every other outcome.
    #[instrument(skip_all, fields(session = %ctx.journal.session_id(), tool = tool_name))]
    pub fn invoke(
        &self,
        ctx: &mut InvocationContext<'_>,
        tool_name: &str,
        arguments: Value,
        policy: &SandboxPolicy,
    ) -> Result<ToolResult, GatewayError> {
        let started = Instant::now();
        let mut result = ToolResult {
            invocation_id: Uuid::new_v4(),
            tool: tool_name.to_string(),
            arguments: arguments.clone(),
            outcome: ToolOutcome::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            detail: None,
        };

        let Some(tool) = self.registry.get(tool_name) else {
            result.outcome = ToolOutcome::NotFound;
            result.detail = Some(format!("no tool named {tool_name}"));
            self.finish(ctx, &mut result, started)?;
            return Err(GatewayError::ToolNotFound(tool_name.to_string()));
        };

        let mut tool_ctx = ToolContext {
            workdir: self.workdir.clone(),
            policy: policy.clone(),
            timeout: policy.timeout,
            cancel: CancelToken::new(),
        };

        let accesses = match tool.access(&arguments, &tool_ctx) {
            Ok(accesses) => accesses,
            Err(err) => {
                result.detail = Some(format!("invalid arguments: {err:#}"));
                self.finish(ctx, &mut result, started)?;
                return Ok(result);
            }
        };
        for access in &accesses {
            if let Err(detail) = policy.permits(access) {
                return self.violation(ctx, result, started, detail);
            }
        }

        tool_ctx.timeout = match bounded_timeout(policy.timeout, ctx.deadline) {
            Ok(timeout) => timeout,
            Err(err) => {
                result.outcome = ToolOutcome::TimedOut;
                result.detail = Some(format!("{err:#}"));
                self.finish(ctx, &mut result, started)?;
                return Ok(result);
            }
        };

        match run_supervised(tool, arguments, tool_ctx, ctx.cancel) {
            Supervised::Finished(Ok(run)) => {
                result.outcome = if run.timed_out {
                    ToolOutcome::TimedOut
                } else if run.success {
                    ToolOutcome::Succeeded
                } else {
                    ToolOutcome::Failed
                };
                result.exit_code = run.exit_code;
                result.stdout = run.stdout;
                result.stderr = run.stderr;
            }
            Supervised::Finished(Err(err)) => {
                if let Some(breach) = err.downcast_ref::<SandboxBreach>() {
                    let detail = breach.0.clone();
                    return self.violation(ctx, result, started, detail);
                }
                result.detail = Some(format!("{err:#}"));
            }
            Supervised::Stopped { reason, run } => {
                result.outcome = ToolOutcome::TimedOut;
                result.detail = Some(reason);
                if let Some(run) = run {
                    result.exit_code = run.exit_code;
                    result.stdout = run.stdout;
                    result.stderr = run.stderr;
                }
            }
            Supervised::Panicked => {
                result.detail = Some("tool panicked".to_string());
            }
        }

        result.stdout = truncate_output(std::mem::take(&mut result.stdout), policy.max_output_bytes);
        result.stderr = truncate_output(std::mem::take(&mut result.stderr), policy.max_output_bytes);
        self.finish(ctx, &mut result, started)?;
        Ok(result)
    }

    fn violation(
        &self,
        ctx: &mut InvocationContext<'_>,
        mut result: ToolResult,
        started: Instant,
        detail: String,
    ) -> Result<ToolResult, GatewayError> {
        warn!(detail = %detail, "sandbox violation");
        result.outcome = ToolOutcome::SandboxViolation;
        result.detail = Some(detail.clone());
        self.finish(ctx, &mut result, started)?;
        Err(GatewayError::SandboxViolation {
            tool: result.tool,
            detail,
        })
    }

    fn finish(
        &self,
        ctx: &mut InvocationContext<'_>,
        result: &mut ToolResult,
        started: Instant,
    ) -> Result<(), GatewayError> {
        result.duration_ms = started.elapsed().as_millis() as u64;
        ctx.journal
            .record(&LogRecord::ToolInvocation(result.clone()))?;
        info!(
            outcome = ?result.outcome,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "tool invocation recorded"
        );
        Ok(())
    }
}

enum Supervised {
    Finished(Result<ToolRun>),
    /// Timed out or cancelled. `run` is set if the tool stopped within the grace period.
    Stopped {
        reason: String,
        run: Option<ToolRun>,
    },
    Panicked,
}

/// Run the tool on a worker thread and watch the clock and the session cancel signal.
fn run_supervised(
    tool: Arc<dyn Tool>,
    arguments: Value,
    tool_ctx: ToolContext,
    session_cancel: &CancelToken,
) -> Supervised {
    let (tx, rx) = mpsc::channel();
    let stop = tool_ctx.cancel.clone();
    let timeout = tool_ctx.timeout;
    let started = Instant::now();
    thread::spawn(move || {
        let outcome = tool.run(&arguments, &tool_ctx);
        // The receiver is gone when the supervisor gave up on us.
        let _ = tx.send(outcome);
    });

    let mut stopping: Option<(String, Instant)> = None;
    loop {
        match rx.recv_timeout(POLL) {
            Ok(outcome) => {
                return match stopping {
                    Some((reason, _)) => Supervised::Stopped {
                        reason,
                        run: outcome.ok(),
                    },
                    None => Supervised::Finished(outcome),
                };
            }
            Err(RecvTimeoutError::Disconnected) => return Supervised::Panicked,
            Err(RecvTimeoutError::Timeout) => {}
        }
        match &stopping {
            Some((reason, since)) => {
                if since.elapsed() >= STOP_GRACE {
                    warn!(reason = %reason, "tool did not stop in time, abandoning");
                    return Supervised::Stopped {
                        reason: format!("{reason}; tool abandoned"),
                        run: None,
                    };
                }
            }
            None => {
                let reason = if session_cancel.is_cancelled() {
                    let why = session_cancel.reason().unwrap_or_default();
                    Some(format!("cancelled: {why}"))
                } else if started.elapsed() >= timeout + POLL {
                    Some(format!("timed out after {}ms", timeout.as_millis()))
                } else {
                    None
                };
                if let Some(reason) = reason {
                    stop.cancel(reason.clone());
                    stopping = Some((reason, Instant::now()));
                }
            }
        }
    }
}

/// Keep at most `limit` bytes of `text` (on a char boundary) and note what was cut.
pub fn truncate_output(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    let mut kept = text[..cut].to_string();
    kept.push_str(&format!("\n[truncated {dropped} bytes]"));
    kept
}
