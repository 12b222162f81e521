//! Context loader: turns past session logs into a bounded memory bundle.
//!
//! Candidates are the latest outcome of each related session, diagnostics of
//! its failed validations and its planning decisions. They are ranked by
//! relevance to the request blended with recency, then packed greedily under
//! the entry and token caps. Whatever does not fit is dropped.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::budget::estimate_tokens;
use crate::core::log::{LogKind, LogRecord};
use crate::core::relevance::RelevanceRanker;
use crate::core::types::{Feature, SessionId, SessionState};
use crate::error::StoreError;
use crate::io::log_store::{LogFilter, LogStore, RecalledEntry};

const RELEVANCE_WEIGHT: f64 = 0.7;
const RECENCY_WEIGHT: f64 = 0.3;
/// Diagnostics quoted per failed validation.
const DIAGNOSTICS_PER_ITEM: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub max_entries: usize,
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextItemKind {
    Outcome,
    ValidationFailure,
    PlanningDecision,
}

/// One remembered fact from a past session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub session_id: SessionId,
    /// Description of the past session's feature.
    pub feature: String,
    pub kind: ContextItemKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub relevance: f64,
}

impl ContextItem {
    fn tokens(&self) -> usize {
        estimate_tokens(&self.feature) + estimate_tokens(&self.text)
    }
}

/// Memory handed to planning. Never exceeds its budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextBundle {
    pub items: Vec<ContextItem>,
    /// Candidates left out to respect the budget.
    pub dropped: usize,
    pub tokens: usize,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct ContextLoader {
    store: Arc<dyn LogStore>,
    ranker: Arc<dyn RelevanceRanker>,
    budget: ContextBudget,
}

impl ContextLoader {
    pub fn new(
        store: Arc<dyn LogStore>,
        ranker: Arc<dyn RelevanceRanker>,
        budget: ContextBudget,
    ) -> Self {
        Self {
            store,
            ranker,
            budget,
        }
    }

    pub fn budget(&self) -> ContextBudget {
        self.budget
    }

    /// Build the memory bundle for `request`.
    pub fn load(&self, request: &Feature) -> Result<ContextBundle, StoreError> {
        self.load_for(request, None)
    }

    /// Build the memory bundle, leaving out the requesting session's own log.
    #[instrument(skip_all, fields(exclude = ?exclude))]
    pub fn load_for(
        &self,
        request: &Feature,
        exclude: Option<SessionId>,
    ) -> Result<ContextBundle, StoreError> {
        let filter = LogFilter {
            kinds: vec![
                LogKind::PhaseTransition,
                LogKind::Abort,
                LogKind::ValidationResult,
                LogKind::PlanningDecision,
            ],
            exclude_session: exclude,
            ..LogFilter::related_to(request)
        };
        let recalled = self.store.read_across_sessions(&filter)?;
        let now = Utc::now();

        let mut candidates: Vec<(f64, ContextItem)> = candidates(&recalled)
            .into_iter()
            .map(|(past, mut item)| {
                item.relevance = self.ranker.score(request, past);
                let score = RELEVANCE_WEIGHT * item.relevance
                    + RECENCY_WEIGHT * recency(item.timestamp, now);
                (score, item)
            })
            .collect();
        candidates.sort_by(|(a, x), (b, y)| {
            b.total_cmp(a).then_with(|| y.timestamp.cmp(&x.timestamp))
        });

        let bundle = pack(candidates.into_iter().map(|(_, item)| item), self.budget);
        debug!(
            items = bundle.items.len(),
            dropped = bundle.dropped,
            tokens = bundle.tokens,
            "context bundle loaded"
        );
        Ok(bundle)
    }
}

/// 1.0 for now, halving after one day, approaching zero for old entries.
fn recency(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - timestamp).num_seconds().max(0) as f64 / 86_400.0;
    1.0 / (1.0 + age_days)
}

/// Greedily keep items in order while both caps hold.
fn pack(items: impl Iterator<Item = ContextItem>, budget: ContextBudget) -> ContextBundle {
    let mut bundle = ContextBundle::default();
    for item in items {
        let tokens = item.tokens();
        if bundle.items.len() >= budget.max_entries || bundle.tokens + tokens > budget.max_tokens
        {
            bundle.dropped += 1;
            continue;
        }
        bundle.tokens += tokens;
        bundle.items.push(item);
    }
    bundle
}

/// Turn recalled entries (most recent first) into candidate items.
fn candidates(recalled: &[RecalledEntry]) -> Vec<(&Feature, ContextItem)> {
    let mut seen_outcome: HashSet<SessionId> = HashSet::new();
    let mut out = Vec::new();
    for recalled in recalled {
        let entry = &recalled.entry;
        let Ok(record) = entry.record() else {
            continue;
        };
        let made = match record {
            LogRecord::Transition(t) if t.to.is_terminal() => {
                if !seen_outcome.insert(entry.session_id) {
                    continue;
                }
                let mut text = match t.to {
                    SessionState::Succeeded => {
                        format!("succeeded after {} attempt(s)", t.attempt)
                    }
                    _ => format!("{} after {} attempt(s)", t.to, t.attempt),
                };
                if let Some(reason) = t.reason.filter(|r| !r.is_empty()) {
                    text.push_str(": ");
                    text.push_str(&reason);
                }
                Some((ContextItemKind::Outcome, text))
            }
            LogRecord::Abort(a) => {
                if !seen_outcome.insert(entry.session_id) {
                    continue;
                }
                Some((
                    ContextItemKind::Outcome,
                    format!("aborted during {}: {}", a.from, a.reason),
                ))
            }
            LogRecord::Validation(v) if !v.result.passed => {
                let mut lines: Vec<String> = v
                    .result
                    .diagnostics
                    .iter()
                    .take(DIAGNOSTICS_PER_ITEM)
                    .map(|d| format!("{}: {}", d.location, d.message))
                    .collect();
                if lines.is_empty() {
                    lines.push("validation failed without diagnostics".to_string());
                }
                Some((
                    ContextItemKind::ValidationFailure,
                    format!("attempt {} failed validation: {}", v.attempt, lines.join("; ")),
                ))
            }
            LogRecord::Planning(p) => {
                let mut text = p.summary;
                if !p.steps.is_empty() {
                    text.push_str(" (steps: ");
                    text.push_str(&p.steps.join("; "));
                    text.push(')');
                }
                Some((ContextItemKind::PlanningDecision, text))
            }
            _ => None,
        };
        if let Some((kind, text)) = made {
            out.push((
                &recalled.feature,
                ContextItem {
                    session_id: entry.session_id,
                    feature: recalled.feature.description.clone(),
                    kind,
                    text,
                    timestamp: entry.timestamp,
                    relevance: 0.0,
                },
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log::{PlanningPayload, TransitionPayload, ValidationPayload};
    use crate::core::relevance::KeywordRanker;
    use crate::core::session::Session;
    use crate::core::types::{Diagnostic, ValidationResult};
    use crate::io::journal::SessionJournal;
    use crate::io::log_store::FileLogStore;

    fn store(dir: &std::path::Path) -> Arc<dyn LogStore> {
        Arc::new(FileLogStore::open(dir).expect("store"))
    }

    fn loader(store: &Arc<dyn LogStore>, max_entries: usize, max_tokens: usize) -> ContextLoader {
        ContextLoader::new(
            Arc::clone(store),
            Arc::new(KeywordRanker::default()),
            ContextBudget {
                max_entries,
                max_tokens,
            },
        )
    }

    /// Write a finished session: creation, plan, failed validation, outcome.
    fn past_session(store: &Arc<dyn LogStore>, description: &str, outcome: SessionState) -> SessionId {
        let id = SessionId::generate();
        let mut journal = SessionJournal::new(Arc::clone(store), id);
        journal
            .record(&LogRecord::Transition(Session::creation(&Feature::new(
                description,
            ))))
            .expect("create");
        journal
            .record(&LogRecord::Planning(PlanningPayload {
                summary: format!("plan for {description}"),
                steps: vec!["edit".to_string()],
                context_items: 0,
            }))
            .expect("plan");
        journal
            .record(&LogRecord::Validation(ValidationPayload {
                attempt: 1,
                result: ValidationResult {
                    passed: false,
                    diagnostics: vec![Diagnostic {
                        check: "ci".to_string(),
                        location: "src/lib.rs:1:1".to_string(),
                        message: "mismatched types".to_string(),
                    }],
                    ..ValidationResult::default()
                },
            }))
            .expect("validation");
        journal
            .record(&LogRecord::Transition(TransitionPayload {
                from: Some(SessionState::Validating),
                to: outcome,
                attempt: 2,
                reason: None,
                feature: None,
            }))
            .expect("outcome");
        id
    }

    #[test]
    fn empty_store_gives_empty_bundle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let bundle = loader(&store, 10, 1_000)
            .load(&Feature::new("add login endpoint"))
            .expect("load");
        assert!(bundle.is_empty());
        assert_eq!(bundle.dropped, 0);
    }

    #[test]
    fn related_sessions_yield_outcome_failure_and_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        past_session(&store, "add login endpoint", SessionState::Succeeded);
        past_session(&store, "bump release version", SessionState::Failed);

        let bundle = loader(&store, 10, 1_000)
            .load(&Feature::new("fix login endpoint timeout"))
            .expect("load");
        let kinds: HashSet<ContextItemKind> = bundle.items.iter().map(|i| i.kind).collect();
        assert_eq!(bundle.items.len(), 3);
        assert!(kinds.contains(&ContextItemKind::Outcome));
        assert!(kinds.contains(&ContextItemKind::ValidationFailure));
        assert!(kinds.contains(&ContextItemKind::PlanningDecision));
        assert!(bundle.items.iter().all(|i| i.feature == "add login endpoint"));
        let outcome = bundle
            .items
            .iter()
            .find(|i| i.kind == ContextItemKind::Outcome)
            .expect("outcome");
        assert_eq!(outcome.text, "succeeded after 2 attempt(s)");
    }

    #[test]
    fn bundle_never_exceeds_caps_and_counts_drops() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        for _ in 0..6 {
            past_session(&store, "login endpoint work", SessionState::Failed);
        }
        let request = Feature::new("login endpoint");

        let by_entries = loader(&store, 4, 10_000).load(&request).expect("load");
        assert_eq!(by_entries.items.len(), 4);
        assert_eq!(by_entries.dropped, 18 - 4);

        let by_tokens = loader(&store, 100, 40).load(&request).expect("load");
        assert!(by_tokens.tokens <= 40);
        assert_eq!(
            by_tokens.tokens,
            by_tokens.items.iter().map(ContextItem::tokens).sum::<usize>()
        );
        assert_eq!(by_tokens.items.len() + by_tokens.dropped, 18);
    }

    #[test]
    fn more_relevant_items_rank_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        past_session(&store, "login endpoint", SessionState::Succeeded);
        past_session(&store, "login page styling colors", SessionState::Succeeded);

        let bundle = loader(&store, 10, 10_000)
            .load(&Feature::new("login endpoint"))
            .expect("load");
        assert_eq!(bundle.items[0].feature, "login endpoint");
        assert!(bundle.items[0].relevance > bundle.items.last().expect("item").relevance);
    }

    #[test]
    fn excluded_session_is_not_recalled() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let id = past_session(&store, "login endpoint", SessionState::Succeeded);
        let bundle = loader(&store, 10, 10_000)
            .load_for(&Feature::new("login endpoint"), Some(id))
            .expect("load");
        assert!(bundle.is_empty());
    }

    #[test]
    fn recency_decays_with_age() {
        let now = Utc::now();
        assert_eq!(recency(now, now), 1.0);
        assert!((recency(now - chrono::Duration::days(1), now) - 0.5).abs() < 1e-9);
        assert!(recency(now - chrono::Duration::days(30), now) < 0.05);
    }
}
