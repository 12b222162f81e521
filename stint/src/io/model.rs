//! Model backend abstraction.
//!
//! The [`ModelBackend`] trait decouples the orchestrator from whatever
//! produces plans, tool calls and retry guidance. [`CommandModelBackend`]
//! drives an external agent CLI; tests use scripted backends that answer
//! without spawning processes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::context_loader::ContextBundle;
use crate::core::cancel::CancelToken;
use crate::core::types::{Diagnostic, Feature, Plan, SessionId, ToolCall};
use crate::io::config::ModelConfig;
use crate::io::gateway::ToolSpec;
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::prompt::PromptBuilder;

const MODEL_RESPONSE_SCHEMA: &str = include_str!("../../schemas/model_response.schema.json");

/// What the orchestrator is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase {
    Planning,
    Implementation,
    Retry,
}

impl ModelPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Implementation => "implementation",
            Self::Retry => "retry",
        }
    }
}

/// Everything a backend may use to answer one phase.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub session_id: SessionId,
    pub phase: ModelPhase,
    /// Implementation attempt the request belongs to (0 while planning).
    pub attempt: u32,
    pub feature: Feature,
    pub context: ContextBundle,
    pub plan: Option<Plan>,
    /// Diagnostics of the last failed validation.
    pub diagnostics: Vec<Diagnostic>,
    pub guidance: Option<String>,
    pub tools: Vec<ToolSpec>,
    /// Wall-clock limit for this call.
    pub timeout: Duration,
}

/// Structured answer of a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelResponse {
    Plan {
        summary: String,
        #[serde(default)]
        steps: Vec<String>,
    },
    Implementation {
        #[serde(default)]
        summary: String,
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    RetryGuidance {
        guidance: String,
        /// The failure cannot be fixed within the feature; stop retrying.
        #[serde(default)]
        give_up: bool,
    },
}

impl ModelResponse {
    /// True when this response is the kind `phase` asks for.
    pub fn answers(&self, phase: ModelPhase) -> bool {
        matches!(
            (self, phase),
            (Self::Plan { .. }, ModelPhase::Planning)
                | (Self::Implementation { .. }, ModelPhase::Implementation)
                | (Self::RetryGuidance { .. }, ModelPhase::Retry)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Plan { .. } => "plan",
            Self::Implementation { .. } => "implementation",
            Self::RetryGuidance { .. } => "retry_guidance",
        }
    }
}

/// A model capability. Implementations do not retry; the orchestrator does.
pub trait ModelBackend: Send + Sync {
    fn respond(&self, request: &ModelRequest, cancel: &CancelToken) -> Result<ModelResponse>;
}

/// Backend that runs an agent command per request.
///
/// The prompt goes to stdin. `{schema}` and `{output}` in the command are
/// replaced by the response schema path and the path the agent must write
/// its final JSON answer to. Each call gets its own scratch directory under
/// `scratch_dir/<session>/` holding the prompt, schema, answer and a log.
pub struct CommandModelBackend {
    command: Vec<String>,
    workdir: PathBuf,
    scratch_dir: PathBuf,
    output_limit_bytes: usize,
    prompt: PromptBuilder,
    validator: Validator,
    calls: AtomicU64,
}

impl CommandModelBackend {
    pub fn new(
        config: &ModelConfig,
        workdir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        if config.command.is_empty() {
            bail!("model command must not be empty");
        }
        let schema: Value =
            serde_json::from_str(MODEL_RESPONSE_SCHEMA).context("parse model response schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile model response schema")?;
        Ok(Self {
            command: config.command.clone(),
            workdir: workdir.into(),
            scratch_dir: scratch_dir.into(),
            output_limit_bytes: config.output_limit_bytes,
            prompt: PromptBuilder::new(config.prompt_budget_bytes),
            validator,
            calls: AtomicU64::new(0),
        })
    }

    fn call_dir(&self, request: &ModelRequest) -> PathBuf {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.scratch_dir
            .join(request.session_id.to_string())
            .join(format!("{}-{}-{n}", request.phase.as_str(), request.attempt))
    }

    fn parse_response(&self, raw: &str) -> Result<ModelResponse> {
        let value: Value = serde_json::from_str(raw).context("parse model output json")?;
        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!("model output failed schema validation:\n- {}", messages.join("\n- "));
        }
        serde_json::from_value(value).context("decode model output")
    }
}

impl ModelBackend for CommandModelBackend {
    #[instrument(skip_all, fields(session = %request.session_id, phase = request.phase.as_str(), attempt = request.attempt))]
    fn respond(&self, request: &ModelRequest, cancel: &CancelToken) -> Result<ModelResponse> {
        let dir = self.call_dir(request);
        fs::create_dir_all(&dir).with_context(|| format!("create model dir {}", dir.display()))?;
        let schema_path = dir.join("response.schema.json");
        let output_path = dir.join("response.json");
        fs::write(&schema_path, MODEL_RESPONSE_SCHEMA)
            .with_context(|| format!("write {}", schema_path.display()))?;
        // The call counter restarts with the process, so this directory may
        // hold an answer from an earlier run.
        match fs::remove_file(&output_path) {
            Ok(()) => debug!(path = %output_path.display(), "removed stale model output"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("remove stale {}", output_path.display()));
            }
        }

        let prompt = self.prompt.build(request)?;
        fs::write(dir.join("prompt.md"), &prompt).context("write prompt")?;

        let args: Vec<String> = self
            .command
            .iter()
            .map(|arg| {
                arg.replace("{schema}", &schema_path.to_string_lossy())
                    .replace("{output}", &output_path.to_string_lossy())
            })
            .collect();
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("model command must not be empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(rest).current_dir(&self.workdir);

        info!(program = %program, "starting model command");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
            Some(cancel),
        )
        .context("run model command")?;
        write_model_log(&dir.join("model.log"), &output)?;

        if output.cancelled {
            bail!("model command cancelled");
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "model command timed out");
            bail!("model command timed out after {:?}", request.timeout);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "model command failed");
            bail!("model command failed with status {:?}", output.status.code());
        }

        let raw = fs::read_to_string(&output_path)
            .with_context(|| format!("read model output {}", output_path.display()))?;
        let response = self.parse_response(&raw)?;
        debug!(kind = response.kind(), "parsed model response");
        Ok(response)
    }
}

fn write_model_log(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text("model"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_text("model"));
    if output.timed_out {
        buf.push_str("\n[model timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write model log {}", path.display()))
}
