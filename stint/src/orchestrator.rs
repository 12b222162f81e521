//! Session orchestrator: drives one feature through plan, implement, validate
//! and iterate.
//!
//! Each session is owned by a slot holding its in-memory [`Session`], the
//! journal that stamps its log entries and a cancel signal. `advance` takes the
//! slot lock for the whole phase, so calls for one session are serialized while
//! distinct sessions proceed in parallel and share only the log store. Every
//! transition is appended to the log before the in-memory session changes.
//! Finished sessions leave memory and are rebuilt from their log on demand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use crate::context_loader::{ContextBudget, ContextBundle, ContextLoader};
use crate::core::budget::bounded_timeout;
use crate::core::cancel::CancelToken;
use crate::core::log::{AbortPayload, LogEntry, LogRecord, PlanningPayload, ValidationPayload};
use crate::core::relevance::{KeywordRanker, RelevanceRanker};
use crate::core::scope::{HeuristicScopeGuard, ScopeDecision, ScopeGuard};
use crate::core::session::{Session, TransitionError};
use crate::core::types::{Feature, SessionId, SessionState, SessionStatus};
use crate::error::{GatewayError, OrchestratorError, StoreError};
use crate::io::config::StintConfig;
use crate::io::gateway::{Gateway, InvocationContext, SandboxPolicy};
use crate::io::init::StintPaths;
use crate::io::journal::SessionJournal;
use crate::io::log_store::{FileLogStore, LogStore};
use crate::io::model::{CommandModelBackend, ModelBackend, ModelPhase, ModelRequest, ModelResponse};
use crate::io::tools::builtin_registry;
use crate::io::validation::{Artifact, ValidationEngine};

/// Limits and locations the orchestrator runs under.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Implementation attempts per session, the first one included.
    pub max_attempts: u32,
    /// Wall-clock budget of one implementation attempt.
    pub attempt_timeout: Duration,
    /// Extra model calls after an unusable response.
    pub model_retries: u32,
    pub model_timeout: Duration,
    pub policy: SandboxPolicy,
    pub context: ContextBudget,
    pub workdir: PathBuf,
}

impl OrchestratorSettings {
    pub fn from_config(root: &Path, config: &StintConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            attempt_timeout: config.attempt_timeout(),
            model_retries: config.model.retries,
            model_timeout: Duration::from_secs(config.model.timeout_secs),
            policy: config.sandbox_policy(root),
            context: ContextBudget {
                max_entries: config.context.max_entries,
                max_tokens: config.context.max_tokens,
            },
            workdir: root.to_path_buf(),
        }
    }
}

/// Collaborators plugged into an orchestrator.
pub struct Components {
    pub store: Arc<dyn LogStore>,
    pub model: Arc<dyn ModelBackend>,
    pub gateway: Gateway,
    pub validation: ValidationEngine,
    pub scope: Arc<dyn ScopeGuard>,
    pub ranker: Arc<dyn RelevanceRanker>,
}

/// Returned by [`Orchestrator::start`] for an accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
}

struct SessionCell {
    session: Session,
    journal: SessionJournal,
    /// End of the running implementation attempt's budget.
    deadline: Option<Instant>,
    /// Model summary of the last implementation attempt.
    attempt_summary: String,
}

struct SessionSlot {
    cell: Mutex<SessionCell>,
    cancel: CancelToken,
    /// Last published status, readable while a phase holds `cell`.
    status: Mutex<SessionStatus>,
}

impl SessionSlot {
    fn new(session: Session, journal: SessionJournal) -> Self {
        let status = session.status();
        Self {
            cell: Mutex::new(SessionCell {
                session,
                journal,
                deadline: None,
                attempt_summary: String::new(),
            }),
            cancel: CancelToken::new(),
            status: Mutex::new(status),
        }
    }

    fn publish(&self, cell: &SessionCell) -> SessionStatus {
        let status = cell.session.status();
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.clone();
        status
    }
}

/// Why a phase stopped early.
enum StepError {
    Storage(StoreError),
    Transition(TransitionError),
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err)
    }
}

impl From<TransitionError> for StepError {
    fn from(err: TransitionError) -> Self {
        Self::Transition(err)
    }
}

type StepResult = Result<(), StepError>;

pub struct Orchestrator {
    settings: OrchestratorSettings,
    store: Arc<dyn LogStore>,
    model: Arc<dyn ModelBackend>,
    gateway: Gateway,
    validation: ValidationEngine,
    scope: Arc<dyn ScopeGuard>,
    context: ContextLoader,
    sessions: Mutex<HashMap<SessionId, Arc<SessionSlot>>>,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, components: Components) -> Self {
        let context = ContextLoader::new(
            Arc::clone(&components.store),
            components.ranker,
            settings.context,
        );
        Self {
            settings,
            store: components.store,
            model: components.model,
            gateway: components.gateway,
            validation: components.validation,
            scope: components.scope,
            context,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Orchestrator for the workspace at `root` with the file log store, the
    /// command model backend and the built-in tools.
    pub fn from_config(root: &Path, config: &StintConfig) -> anyhow::Result<Self> {
        let paths = StintPaths::new(root);
        let store: Arc<dyn LogStore> = Arc::new(
            FileLogStore::open(&paths.log_dir)
                .with_context(|| format!("open log store {}", paths.log_dir.display()))?,
        );
        let model = CommandModelBackend::new(&config.model, root, &paths.model_dir)?;
        let components = Components {
            store,
            model: Arc::new(model),
            gateway: Gateway::new(builtin_registry(), root),
            validation: ValidationEngine::from_config(&config.validation),
            scope: Arc::new(HeuristicScopeGuard {
                max_description_chars: config.scope.max_description_chars,
                max_split: config.scope.max_split,
            }),
            ranker: Arc::new(KeywordRanker::default()),
        };
        Ok(Self::new(
            OrchestratorSettings::from_config(root, config),
            components,
        ))
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn context_loader(&self) -> &ContextLoader {
        &self.context
    }

    /// Scope-check `feature` and open a session for it in `Planning`.
    ///
    /// A rejected or split request creates nothing, in memory or in the log.
    #[instrument(skip_all, fields(feature = %feature.description))]
    pub fn start(&self, feature: Feature) -> Result<SessionHandle, OrchestratorError> {
        match self.scope.check(&feature) {
            ScopeDecision::Approved => {}
            ScopeDecision::Rejected(reason) => {
                info!(reason = %reason, "feature request rejected");
                return Err(OrchestratorError::ScopeRejected {
                    reason,
                    split: Vec::new(),
                });
            }
            ScopeDecision::Split(parts) => {
                info!(parts = parts.len(), "feature request bundles several changes");
                return Err(OrchestratorError::ScopeRejected {
                    reason: format!(
                        "request bundles {} independent changes; start one session per part",
                        parts.len()
                    ),
                    split: parts,
                });
            }
        }

        let session_id = SessionId::generate();
        let mut journal = SessionJournal::new(Arc::clone(&self.store), session_id);
        let entry = journal
            .record(&LogRecord::Transition(Session::creation(&feature)))
            .map_err(|source| OrchestratorError::Storage { session_id, source })?;
        let session = Session::new(session_id, feature, entry.timestamp);
        let slot = Arc::new(SessionSlot::new(session, journal));
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, slot);
        info!(session = %session_id, "session started");
        Ok(SessionHandle {
            session_id,
            created_at: entry.timestamp,
        })
    }

    /// Run the current phase and make exactly one transition.
    #[instrument(skip_all, fields(session = %session_id))]
    pub fn advance(&self, session_id: SessionId) -> Result<SessionStatus, OrchestratorError> {
        let slot = self.slot(session_id)?;
        let mut cell = slot.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.session.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                session_id,
                state: cell.session.state(),
            });
        }

        let stepped = if slot.cancel.is_cancelled() {
            let reason = cancel_reason(&slot.cancel);
            self.abort_cell(&mut cell, reason, false)
        } else {
            match cell.session.state() {
                SessionState::Planning => self.plan(&mut cell, &slot.cancel),
                SessionState::Implementing => self.implement(&mut cell, &slot.cancel),
                SessionState::Validating => self.validate(&mut cell, &slot.cancel),
                SessionState::Iterating => self.iterate(&mut cell, &slot.cancel),
                state => Err(StepError::Transition(TransitionError::Terminal(state))),
            }
        };

        let result = match stepped {
            Ok(()) => Ok(()),
            Err(StepError::Transition(err)) => {
                warn!(err = %err, "phase produced an illegal transition");
                Err(OrchestratorError::InvalidTransition {
                    session_id,
                    state: cell.session.state(),
                })
            }
            Err(StepError::Storage(source)) => Err(self.storage_failure(&mut cell, source)),
        };
        let status = slot.publish(&cell);
        drop(cell);
        self.release(session_id, &slot, &status);
        result.map(|()| status)
    }

    /// Force the session into `Aborted`.
    ///
    /// Signals a running phase first, then waits for it to let go of the
    /// session. Aborting a terminal session changes nothing.
    #[instrument(skip_all, fields(session = %session_id))]
    pub fn abort(
        &self,
        session_id: SessionId,
        reason: &str,
    ) -> Result<SessionStatus, OrchestratorError> {
        let slot = self.slot(session_id)?;
        slot.cancel.cancel(reason);
        let mut cell = slot.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.session.is_terminal() {
            return Ok(slot.publish(&cell));
        }
        let result = match self.abort_cell(&mut cell, reason.to_string(), false) {
            Ok(()) => Ok(()),
            Err(StepError::Transition(_)) => Ok(()),
            Err(StepError::Storage(source)) => Err(self.storage_failure(&mut cell, source)),
        };
        let status = slot.publish(&cell);
        drop(cell);
        self.release(session_id, &slot, &status);
        result.map(|()| status)
    }

    /// Current status. Does not wait for a running phase.
    pub fn status(&self, session_id: SessionId) -> Result<SessionStatus, OrchestratorError> {
        let slot = self.slot(session_id)?;
        let status = slot
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(status)
    }

    /// Sessions currently held in memory.
    pub fn resident_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Slot for `session_id`, rebuilt from the log when not in memory.
    ///
    /// The log is read without holding the session map. A rebuilt terminal
    /// session is served without being kept.
    fn slot(&self, session_id: SessionId) -> Result<Arc<SessionSlot>, OrchestratorError> {
        if let Some(slot) = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
        {
            return Ok(Arc::clone(slot));
        }

        let storage = |source| OrchestratorError::Storage { session_id, source };
        let entries: Vec<LogEntry> = self
            .store
            .read_session(session_id)
            .map_err(storage)?
            .collect::<Result<_, _>>()
            .map_err(storage)?;
        if entries.is_empty() {
            return Err(OrchestratorError::SessionNotFound(session_id));
        }
        let session = Session::rehydrate(entries).map_err(|err| OrchestratorError::Storage {
            session_id,
            source: StoreError::Corrupt {
                location: format!("session {session_id}"),
                message: format!("{err:#}"),
            },
        })?;
        let journal = SessionJournal::resume(Arc::clone(&self.store), session_id)
            .map_err(storage)?;
        info!(session = %session_id, state = %session.state(), "session rehydrated from log");

        let terminal = session.is_terminal();
        let slot = Arc::new(SessionSlot::new(session, journal));
        if terminal {
            return Ok(slot);
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(sessions.entry(session_id).or_insert(slot)))
    }

    /// Drop a finished session from memory; later calls rebuild it from the
    /// log. Flagged sessions stay, since their log may lack the final entry.
    fn release(&self, session_id: SessionId, slot: &Arc<SessionSlot>, status: &SessionStatus) {
        if !status.state.is_terminal() || status.flagged_for_inspection {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .get(&session_id)
            .is_some_and(|resident| Arc::ptr_eq(resident, slot))
        {
            sessions.remove(&session_id);
        }
    }

    fn plan(&self, cell: &mut SessionCell, cancel: &CancelToken) -> StepResult {
        let bundle = self
            .context
            .load_for(&cell.session.feature, Some(cell.session.id))?;
        let context_items = bundle.items.len();
        let request = self.request(cell, ModelPhase::Planning, bundle, self.settings.model_timeout);
        let (summary, steps) = match self.ask_model(&request, cancel) {
            Ok(ModelResponse::Plan { summary, steps }) => (summary, steps),
            Ok(other) => {
                let reason = format!("model answered planning with {}", other.kind());
                return self.abort_cell(cell, reason, false);
            }
            Err(reason) => return self.abort_cell(cell, reason, false),
        };

        let payload = PlanningPayload {
            summary,
            steps,
            context_items,
        };
        cell.journal.record(&LogRecord::Planning(payload.clone()))?;
        cell.session.apply_planning(&payload);

        let planned = Feature {
            description: payload.summary.clone(),
            ..cell.session.feature.clone()
        };
        match self.scope.check(&planned) {
            ScopeDecision::Approved => {}
            ScopeDecision::Rejected(reason) => {
                return self.abort_cell(cell, format!("plan out of scope: {reason}"), false);
            }
            ScopeDecision::Split(parts) => {
                let reason = format!("plan spans {} independent changes", parts.len());
                return self.abort_cell(cell, reason, false);
            }
        }

        self.transition(cell, SessionState::Implementing, Some("plan approved".to_string()))?;
        cell.deadline = Some(Instant::now() + self.settings.attempt_timeout);
        Ok(())
    }

    fn implement(&self, cell: &mut SessionCell, cancel: &CancelToken) -> StepResult {
        let deadline = *cell
            .deadline
            .get_or_insert_with(|| Instant::now() + self.settings.attempt_timeout);
        let attempt = cell.session.attempt();

        let calls = match bounded_timeout(self.settings.model_timeout, Some(deadline)) {
            Ok(timeout) => {
                let request =
                    self.request(cell, ModelPhase::Implementation, ContextBundle::default(), timeout);
                match self.ask_model(&request, cancel) {
                    Ok(ModelResponse::Implementation {
                        summary,
                        tool_calls,
                    }) => {
                        cell.attempt_summary = summary;
                        tool_calls
                    }
                    Ok(other) => {
                        let reason = format!("model answered implementation with {}", other.kind());
                        return self.abort_cell(cell, reason, false);
                    }
                    Err(reason) => return self.abort_cell(cell, reason, false),
                }
            }
            Err(err) => {
                warn!(attempt, err = %format!("{err:#}"), "attempt budget spent before implementation");
                cell.attempt_summary = "attempt budget exhausted".to_string();
                Vec::new()
            }
        };

        let mut finished = 0usize;
        for call in calls {
            if cancel.is_cancelled() {
                return self.abort_cell(cell, cancel_reason(cancel), false);
            }
            let invoked = {
                let mut ctx = InvocationContext {
                    journal: &mut cell.journal,
                    cancel,
                    deadline: Some(deadline),
                };
                self.gateway
                    .invoke(&mut ctx, &call.tool, call.arguments, &self.settings.policy)
            };
            match invoked {
                Ok(_) => finished += 1,
                Err(GatewayError::ToolNotFound(name)) => {
                    warn!(tool = %name, "model requested an unknown tool");
                    finished += 1;
                }
                Err(GatewayError::SandboxViolation { tool, detail }) => {
                    let reason = format!("sandbox violation by {tool}: {detail}");
                    return self.abort_cell(cell, reason, false);
                }
                Err(GatewayError::Storage(err)) => return Err(err.into()),
            }
        }
        if cancel.is_cancelled() {
            return self.abort_cell(cell, cancel_reason(cancel), false);
        }

        let reason = format!("attempt {attempt}: {finished} tool call(s) finished");
        self.transition(cell, SessionState::Validating, Some(reason))
    }

    fn validate(&self, cell: &mut SessionCell, cancel: &CancelToken) -> StepResult {
        let attempt = cell.session.attempt();
        let artifact = Artifact {
            workdir: self.settings.workdir.clone(),
            attempt,
            summary: cell.attempt_summary.clone(),
        };
        let result = self.validation.validate(cell.session.id, &artifact, cancel);
        if result.cancelled {
            return self.abort_cell(cell, cancel_reason(cancel), false);
        }

        let passed = result.passed;
        let diagnostics = result.diagnostics.len();
        let payload = ValidationPayload { attempt, result };
        cell.journal.record(&LogRecord::Validation(payload.clone()))?;
        cell.session.apply_validation(&payload);
        info!(attempt, passed, diagnostics, "validation recorded");

        if passed {
            self.transition(cell, SessionState::Succeeded, Some("validation passed".to_string()))
        } else if attempt >= self.settings.max_attempts {
            let reason = format!("validation failed after {attempt} attempt(s)");
            self.transition(cell, SessionState::Failed, Some(reason))
        } else {
            let reason = format!("validation failed with {diagnostics} diagnostic(s)");
            self.transition(cell, SessionState::Iterating, Some(reason))
        }
    }

    fn iterate(&self, cell: &mut SessionCell, cancel: &CancelToken) -> StepResult {
        let attempt = cell.session.attempt();
        if attempt >= self.settings.max_attempts {
            let reason = format!("retry budget exhausted after {attempt} attempt(s)");
            return self.transition(cell, SessionState::Failed, Some(reason));
        }

        let request = self.request(
            cell,
            ModelPhase::Retry,
            ContextBundle::default(),
            self.settings.model_timeout,
        );
        match self.ask_model(&request, cancel) {
            Ok(ModelResponse::RetryGuidance { guidance, give_up }) => {
                if give_up {
                    let reason = format!("model declined to retry: {}", guidance.trim());
                    return self.transition(cell, SessionState::Failed, Some(reason));
                }
                let guidance = match guidance.trim() {
                    "" => "retry after validation failure".to_string(),
                    text => text.to_string(),
                };
                self.transition(cell, SessionState::Implementing, Some(guidance))?;
                cell.deadline = Some(Instant::now() + self.settings.attempt_timeout);
                Ok(())
            }
            Ok(other) => {
                let reason = format!("model answered retry with {}", other.kind());
                self.abort_cell(cell, reason, false)
            }
            Err(reason) => self.abort_cell(cell, reason, false),
        }
    }

    fn request(
        &self,
        cell: &SessionCell,
        phase: ModelPhase,
        context: ContextBundle,
        timeout: Duration,
    ) -> ModelRequest {
        let session = &cell.session;
        ModelRequest {
            session_id: session.id,
            phase,
            attempt: session.attempt(),
            feature: session.feature.clone(),
            context,
            plan: session.plan().cloned(),
            diagnostics: session.last_diagnostics().to_vec(),
            guidance: session.guidance().map(str::to_string),
            tools: self.gateway.tools(),
            timeout,
        }
    }

    /// Call the model, retrying unusable answers. `Err` is the abort reason.
    fn ask_model(&self, request: &ModelRequest, cancel: &CancelToken) -> Result<ModelResponse, String> {
        let calls = self.settings.model_retries + 1;
        let mut last_problem = String::new();
        for call in 1..=calls {
            if cancel.is_cancelled() {
                return Err(cancel_reason(cancel));
            }
            match self.model.respond(request, cancel) {
                Ok(response) if response.answers(request.phase) => return Ok(response),
                Ok(response) => {
                    last_problem = format!(
                        "expected a {} answer, got {}",
                        request.phase.as_str(),
                        response.kind()
                    );
                }
                Err(err) => last_problem = format!("{err:#}"),
            }
            if cancel.is_cancelled() {
                return Err(cancel_reason(cancel));
            }
            warn!(
                phase = request.phase.as_str(),
                call,
                calls,
                problem = %last_problem,
                "unusable model response"
            );
        }
        Err(format!(
            "model backend unusable after {calls} call(s): {last_problem}"
        ))
    }

    fn transition(
        &self,
        cell: &mut SessionCell,
        to: SessionState,
        reason: Option<String>,
    ) -> StepResult {
        let payload = cell.session.plan_transition(to, reason)?;
        cell.journal.record(&LogRecord::Transition(payload.clone()))?;
        let from = cell.session.state();
        cell.session.apply_transition(&payload);
        info!(
            from = %from,
            to = %to,
            attempt = payload.attempt,
            reason = payload.reason.as_deref().unwrap_or(""),
            "session transition"
        );
        Ok(())
    }

    fn abort_cell(&self, cell: &mut SessionCell, reason: String, flagged: bool) -> StepResult {
        let payload = cell.session.plan_abort(reason, flagged)?;
        cell.journal.record(&LogRecord::Abort(payload.clone()))?;
        cell.session.apply_abort(&payload);
        warn!(from = %payload.from, reason = %payload.reason, "session aborted");
        Ok(())
    }

    /// Abort after the log refused a write. The abort entry is best effort:
    /// the store that just failed may refuse it too.
    fn storage_failure(&self, cell: &mut SessionCell, source: StoreError) -> OrchestratorError {
        let session_id = cell.session.id;
        let reason = format!("storage failure: {source}");
        error!(session = %session_id, err = %source, "session log write failed");
        if !cell.session.is_terminal() {
            let payload = AbortPayload {
                from: cell.session.state(),
                reason: reason.clone(),
                flagged_for_inspection: true,
            };
            if let Err(err) = cell.journal.record(&LogRecord::Abort(payload)) {
                warn!(err = %err, "could not record abort after storage failure");
            }
        }
        cell.session.flag_for_inspection(reason);
        OrchestratorError::Storage { session_id, source }
    }
}

fn cancel_reason(cancel: &CancelToken) -> String {
    cancel
        .reason()
        .unwrap_or_else(|| "cancelled".to_string())
}
