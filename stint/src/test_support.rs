//! Test-only doubles: scripted model and checks, test tools, a failing store
//! and a harness wiring them into an [`Orchestrator`].

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::context_loader::ContextBudget;
use crate::core::cancel::CancelToken;
use crate::core::log::LogEntry;
use crate::core::relevance::KeywordRanker;
use crate::core::scope::HeuristicScopeGuard;
use crate::core::types::{Diagnostic, SessionId, ToolCall};
use crate::error::StoreError;
use crate::io::gateway::{Access, Gateway, SandboxPolicy, Tool, ToolContext, ToolRun};
use crate::io::log_store::{EntryIter, FileLogStore, LogFilter, LogStore, RecalledEntry};
use crate::io::model::{ModelBackend, ModelPhase, ModelRequest, ModelResponse};
use crate::io::tools::builtin_registry;
use crate::io::validation::{Artifact, Check, CheckReport, ValidationEngine};
use crate::orchestrator::{Components, Orchestrator, OrchestratorSettings};

pub fn plan(summary: &str) -> ModelResponse {
    ModelResponse::Plan {
        summary: summary.to_string(),
        steps: vec!["implement".to_string()],
    }
}

pub fn implementation(summary: &str, tool_calls: Vec<ToolCall>) -> ModelResponse {
    ModelResponse::Implementation {
        summary: summary.to_string(),
        tool_calls,
    }
}

pub fn retry(guidance: &str, give_up: bool) -> ModelResponse {
    ModelResponse::RetryGuidance {
        guidance: guidance.to_string(),
        give_up,
    }
}

pub fn tool_call(tool: &str, arguments: Value) -> ToolCall {
    ToolCall {
        tool: tool.to_string(),
        arguments,
    }
}

/// Model backend answering from a FIFO queue, then with a default per phase.
///
/// Queued answers are returned whatever phase asks, so tests can script
/// wrong-phase answers. Every request is recorded.
#[derive(Default)]
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Result<ModelResponse, String>>>,
    calls: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: ModelResponse) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(response));
    }

    /// Queue a failed call (timeout, bad output, crash).
    pub fn push_error(&self, message: &str) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<ModelRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ModelBackend for ScriptedModel {
    fn respond(&self, request: &ModelRequest, _cancel: &CancelToken) -> Result<ModelResponse> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let queued = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match queued {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(match request.phase {
                ModelPhase::Planning => plan(&request.feature.description),
                ModelPhase::Implementation => {
                    implementation(&format!("attempt {}", request.attempt), Vec::new())
                }
                ModelPhase::Retry => retry("address the diagnostics", false),
            }),
        }
    }
}

/// Check with a scripted pass/fail sequence; the last outcome repeats.
pub struct ScriptedCheck {
    name: String,
    outcomes: Vec<bool>,
    runs: AtomicUsize,
}

impl ScriptedCheck {
    pub fn sequence(name: &str, outcomes: Vec<bool>) -> Self {
        Self {
            name: name.to_string(),
            outcomes,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn always_passing(name: &str) -> Self {
        Self::sequence(name, vec![true])
    }

    /// Fails every run with exactly one diagnostic.
    pub fn always_failing(name: &str) -> Self {
        Self::sequence(name, vec![false])
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Check for ScriptedCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _artifact: &Artifact, _cancel: &CancelToken) -> Result<CheckReport> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        let passed = self
            .outcomes
            .get(run)
            .or(self.outcomes.last())
            .copied()
            .unwrap_or(false);
        let diagnostics = if passed {
            Vec::new()
        } else {
            vec![Diagnostic {
                check: self.name.clone(),
                location: "src/lib.rs:1:1".to_string(),
                message: format!("scripted failure on run {}", run + 1),
            }]
        };
        Ok(CheckReport {
            passed,
            timed_out: false,
            diagnostics,
        })
    }
}

/// Tool `echo`: prints `text`. With `touch`, also writes `text` to that path.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Print text. Args: {\"text\": str, \"touch\"?: str}"
    }

    fn access(&self, arguments: &Value, ctx: &ToolContext) -> Result<Vec<Access>> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing string argument `text`"))?;
        Ok(arguments
            .get("touch")
            .and_then(Value::as_str)
            .map(|path| Access::Write {
                path: ctx.resolve(path),
                bytes: text.len() as u64,
            })
            .into_iter()
            .collect())
    }

    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun> {
        let text = arguments.get("text").and_then(Value::as_str).unwrap_or("");
        if let Some(path) = arguments.get("touch").and_then(Value::as_str) {
            fs::write(ctx.resolve(path), text)?;
        }
        Ok(ToolRun::ok(text))
    }
}

/// Tool `sleep`: waits `millis` milliseconds unless cancelled first.
pub struct SleepTool;

impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Wait. Args: {\"millis\": int}"
    }

    fn access(&self, _arguments: &Value, _ctx: &ToolContext) -> Result<Vec<Access>> {
        Ok(Vec::new())
    }

    fn run(&self, arguments: &Value, ctx: &ToolContext) -> Result<ToolRun> {
        let millis = arguments.get("millis").and_then(Value::as_u64).unwrap_or(0);
        let until = Instant::now() + Duration::from_millis(millis);
        while Instant::now() < until {
            if ctx.cancel.is_cancelled() {
                return Ok(ToolRun {
                    timed_out: true,
                    stderr: "interrupted".to_string(),
                    ..ToolRun::default()
                });
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(ToolRun::ok(format!("slept {millis}ms")))
    }
}

/// Store wrapper that refuses appends once its allowance is spent.
pub struct FailingStore {
    inner: Arc<dyn LogStore>,
    remaining: AtomicUsize,
}

impl FailingStore {
    /// Allow `appends` successful appends, then fail every one.
    pub fn after(inner: Arc<dyn LogStore>, appends: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(appends),
        }
    }
}

impl LogStore for FailingStore {
    fn append(&self, entry: LogEntry) -> Result<LogEntry, StoreError> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(StoreError::io(
                "failing-store",
                std::io::Error::other("injected append failure"),
            ));
        }
        self.inner.append(entry)
    }

    fn read_session(&self, session_id: SessionId) -> Result<EntryIter, StoreError> {
        self.inner.read_session(session_id)
    }

    fn read_across_sessions(&self, filter: &LogFilter) -> Result<Vec<RecalledEntry>, StoreError> {
        self.inner.read_across_sessions(filter)
    }

    fn last_sequence(&self, session_id: SessionId) -> Result<u64, StoreError> {
        self.inner.last_sequence(session_id)
    }
}

/// Temp workspace with a file log store, a scripted model and tunable settings.
pub struct Harness {
    _temp: tempfile::TempDir,
    pub workdir: PathBuf,
    pub log_dir: PathBuf,
    pub store: Arc<dyn LogStore>,
    pub model: Arc<ScriptedModel>,
    pub checks: Vec<Arc<ScriptedCheck>>,
    pub settings: OrchestratorSettings,
}

impl Harness {
    /// Panics if the temp workspace cannot be created.
    pub fn new(checks: Vec<ScriptedCheck>) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let workdir = temp.path().join("work");
        fs::create_dir_all(&workdir).expect("create workdir");
        let log_dir = temp.path().join("log");
        let store: Arc<dyn LogStore> =
            Arc::new(FileLogStore::open(&log_dir).expect("open log store"));
        let settings = OrchestratorSettings {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(60),
            model_retries: 2,
            model_timeout: Duration::from_secs(10),
            policy: SandboxPolicy {
                allowed_roots: vec![workdir.clone()],
                allow_network: false,
                timeout: Duration::from_secs(5),
                max_output_bytes: 10_000,
                max_file_bytes: 10_000,
            },
            context: ContextBudget {
                max_entries: 20,
                max_tokens: 2_000,
            },
            workdir: workdir.clone(),
        };
        Self {
            _temp: temp,
            workdir,
            log_dir,
            store,
            model: Arc::new(ScriptedModel::new()),
            checks: checks.into_iter().map(Arc::new).collect(),
            settings,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(Arc::clone(&self.store))
    }

    /// Orchestrator over `store` instead of the harness store.
    pub fn orchestrator_with(&self, store: Arc<dyn LogStore>) -> Orchestrator {
        let mut registry = builtin_registry();
        registry.register(EchoTool).register(SleepTool);
        let checks: Vec<Box<dyn Check>> = self
            .checks
            .iter()
            .map(|check| Box::new(Arc::clone(check)) as Box<dyn Check>)
            .collect();
        let model: Arc<dyn ModelBackend> = self.model.clone();
        Orchestrator::new(
            self.settings.clone(),
            Components {
                store,
                model,
                gateway: Gateway::new(registry, &self.workdir),
                validation: ValidationEngine::new(checks),
                scope: Arc::new(HeuristicScopeGuard::default()),
                ranker: Arc::new(KeywordRanker::default()),
            },
        )
    }

    /// Every durable entry of `session_id`, in sequence order.
    pub fn entries(&self, session_id: SessionId) -> Vec<LogEntry> {
        self.store
            .read_session(session_id)
            .expect("read session")
            .collect::<Result<_, _>>()
            .expect("decode session")
    }

    /// Sessions with a log file.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = fs::read_dir(&self.log_dir)
            .expect("read log dir")
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                path.file_stem()?.to_str()?.parse().ok()
            })
            .collect();
        ids.sort_by_key(ToString::to_string);
        ids
    }
}
