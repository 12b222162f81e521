//! Validation engine: runs every configured check over an implementation attempt.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::diagnostics::{MAX_DIAGNOSTICS_PER_CHECK, output_tail, parse_diagnostics};
use crate::core::types::{CheckSummary, Diagnostic, SessionId, ValidationResult};
use crate::io::config::{CheckConfig, ValidationConfig};
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Lines of output kept when a failing check printed nothing recognisable.
const FALLBACK_TAIL_LINES: usize = 20;

/// What is being validated: the workspace after one implementation attempt.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub workdir: PathBuf,
    pub attempt: u32,
    /// Summary of the attempt, as given by the model.
    pub summary: String,
}

/// Outcome of one check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub passed: bool,
    pub timed_out: bool,
    pub diagnostics: Vec<Diagnostic>,
}

pub trait Check: Send + Sync {
    fn name(&self) -> &str;
    /// Run the check. Errors are reported as a failed check, never propagated.
    fn run(&self, artifact: &Artifact, cancel: &CancelToken) -> Result<CheckReport>;
}

impl<C: Check + ?Sized> Check for Arc<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self, artifact: &Artifact, cancel: &CancelToken) -> Result<CheckReport> {
        (**self).run(artifact, cancel)
    }
}

/// A check backed by an external command (`just ci`, `cargo test`, a linter).
#[derive(Debug, Clone)]
pub struct CommandCheck {
    pub name: String,
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandCheck {
    pub fn from_config(config: &CheckConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl Check for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, artifact: &Artifact, cancel: &CancelToken) -> Result<CheckReport> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("check {} has an empty command", self.name))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&artifact.workdir);

        let output = run_command_with_timeout(
            cmd,
            None,
            self.timeout,
            self.output_limit_bytes,
            Some(cancel),
        )
        .with_context(|| format!("run check {}", self.name))?;

        let passed = output.success();
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let mut diagnostics = Vec::new();
        if !passed {
            diagnostics = parse_diagnostics(&self.name, &combined, MAX_DIAGNOSTICS_PER_CHECK);
            if output.timed_out {
                diagnostics.push(Diagnostic {
                    check: self.name.clone(),
                    location: self.name.clone(),
                    message: format!("timed out after {}s", self.timeout.as_secs()),
                });
            } else if diagnostics.is_empty() {
                let tail = output_tail(&combined, FALLBACK_TAIL_LINES);
                let message = if tail.is_empty() {
                    format!("exited with status {:?}", output.status.code())
                } else {
                    tail
                };
                diagnostics.push(Diagnostic {
                    check: self.name.clone(),
                    location: self.name.clone(),
                    message,
                });
            }
        }

        Ok(CheckReport {
            passed,
            timed_out: output.timed_out,
            diagnostics,
        })
    }
}

/// Pure evaluator over a fixed set of checks. Holds no retry state.
pub struct ValidationEngine {
    checks: Vec<Box<dyn Check>>,
}

impl ValidationEngine {
    pub fn new(checks: Vec<Box<dyn Check>>) -> Self {
        Self { checks }
    }

    pub fn from_config(config: &ValidationConfig) -> Self {
        Self::new(
            config
                .checks
                .iter()
                .map(|c| Box::new(CommandCheck::from_config(c)) as Box<dyn Check>)
                .collect(),
        )
    }

    /// Run every check and aggregate the outcome.
    ///
    /// A failing check does not stop the others. With no checks configured the
    /// result is a failure: nothing has been shown to work.
    #[instrument(skip_all, fields(session = %session_id, attempt = artifact.attempt, checks = self.checks.len()))]
    pub fn validate(
        &self,
        session_id: SessionId,
        artifact: &Artifact,
        cancel: &CancelToken,
    ) -> ValidationResult {
        let started = Instant::now();
        let mut result = ValidationResult::default();

        if self.checks.is_empty() {
            warn!("no validation checks configured");
            result.diagnostics.push(Diagnostic {
                check: "validation".to_string(),
                location: "config".to_string(),
                message: "no validation checks configured".to_string(),
            });
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        let mut all_passed = true;
        for check in &self.checks {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let check_started = Instant::now();
            let report = check.run(artifact, cancel).unwrap_or_else(|err| {
                warn!(check = check.name(), err = %format!("{err:#}"), "check errored");
                CheckReport {
                    passed: false,
                    timed_out: false,
                    diagnostics: vec![Diagnostic {
                        check: check.name().to_string(),
                        location: check.name().to_string(),
                        message: format!("check could not run: {err:#}"),
                    }],
                }
            });
            let duration_ms = check_started.elapsed().as_millis() as u64;
            info!(check = check.name(), passed = report.passed, duration_ms, "check finished");

            all_passed &= report.passed;
            result.checks.push(CheckSummary {
                name: check.name().to_string(),
                passed: report.passed,
                timed_out: report.timed_out,
                duration_ms,
            });
            result.diagnostics.extend(report.diagnostics);
        }
        if cancel.is_cancelled() {
            result.cancelled = true;
        }

        result.passed = all_passed && !result.cancelled;
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result
    }
}
