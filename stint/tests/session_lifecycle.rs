//! Lifecycle tests driving whole sessions through the orchestrator.
//!
//! Every test runs against a real file log store in a temp dir, with a
//! scripted model and scripted checks standing in for the agent and CI.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use stint::core::log::{LogEntry, LogKind, LogRecord, TransitionPayload};
use stint::core::session::Session;
use stint::core::types::{Feature, SessionId, SessionState, ToolOutcome};
use stint::error::OrchestratorError;
use stint::io::journal::SessionJournal;
use stint::io::log_store::{FileLogStore, LogStore};
use stint::io::model::ModelPhase;
use stint::looping::run_to_completion;
use stint::test_support::{
    FailingStore, Harness, ScriptedCheck, implementation, plan, tool_call,
};

fn assert_contiguous(entries: &[LogEntry]) {
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.sequence_number, i as u64 + 1, "gap at {i}");
    }
}

fn count(entries: &[LogEntry], kind: LogKind) -> usize {
    entries.iter().filter(|e| e.kind == kind).count()
}

fn transitions(entries: &[LogEntry]) -> Vec<TransitionPayload> {
    entries
        .iter()
        .filter_map(|e| match e.record().expect("record") {
            LogRecord::Transition(payload) => Some(payload),
            _ => None,
        })
        .collect()
}

#[test]
fn concurrent_appends_keep_sequences_contiguous() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn LogStore> = Arc::new(FileLogStore::open(temp.path()).expect("open"));

    let ids: Vec<SessionId> = (0..4).map(|_| SessionId::generate()).collect();
    thread::scope(|scope| {
        for &id in &ids {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                let mut journal = SessionJournal::new(store, id);
                journal
                    .record(&LogRecord::Transition(Session::creation(&Feature::new(
                        "add retry jitter",
                    ))))
                    .expect("creation");
                for _ in 0..24 {
                    journal
                        .record(&LogRecord::Planning(Default::default()))
                        .expect("append");
                }
            });
        }
    });

    for id in ids {
        let entries: Vec<LogEntry> = store
            .read_session(id)
            .expect("read")
            .collect::<Result<_, _>>()
            .expect("decode");
        assert_eq!(entries.len(), 25);
        assert_contiguous(&entries);
    }
}

#[test]
fn parallel_sessions_share_one_store() {
    let harness = Harness::new(vec![ScriptedCheck::always_passing("ci")]);
    let orch = harness.orchestrator();
    let ids: Vec<SessionId> = ["add retry jitter", "add request ids", "fix flaky timer"]
        .into_iter()
        .map(|d| orch.start(Feature::new(d)).expect("start").session_id)
        .collect();

    thread::scope(|scope| {
        for &id in &ids {
            let orch = &orch;
            scope.spawn(move || run_to_completion(orch, id, |_| {}).expect("run"));
        }
    });

    for id in ids {
        assert_eq!(orch.status(id).expect("status").state, SessionState::Succeeded);
        assert_contiguous(&harness.entries(id));
    }
}

#[test]
fn two_change_request_is_split_and_nothing_is_logged() {
    let harness = Harness::new(vec![ScriptedCheck::always_passing("ci")]);
    let orch = harness.orchestrator();
    let err = orch
        .start(Feature::new("add login endpoint and redesign the dashboard"))
        .unwrap_err();
    match err {
        OrchestratorError::ScopeRejected { split, .. } => {
            let parts: Vec<&str> = split.iter().map(|f| f.description.as_str()).collect();
            assert_eq!(parts, vec!["add login endpoint", "redesign the dashboard"]);
        }
        other => panic!("expected ScopeRejected, got {other:?}"),
    }
    assert!(harness.session_ids().is_empty());
}

#[test]
fn always_failing_check_fails_after_exactly_three_attempts() {
    let harness = Harness::new(vec![ScriptedCheck::always_failing("ci")]);
    let orch = harness.orchestrator();
    let id = orch
        .start(Feature::new("add retry jitter"))
        .expect("start")
        .session_id;

    let outcome = run_to_completion(&orch, id, |_| {}).expect("run");
    assert_eq!(outcome.status.state, SessionState::Failed);
    assert_eq!(outcome.status.attempts, 3);
    assert_eq!(outcome.status.last_diagnostics.len(), 1);

    let entries = harness.entries(id);
    assert_contiguous(&entries);
    assert_eq!(count(&entries, LogKind::ValidationResult), 3);
    let implementing = transitions(&entries)
        .iter()
        .filter(|t| t.to == SessionState::Implementing)
        .count();
    assert_eq!(implementing, 3);

    let err = orch.advance(id).unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    assert_eq!(harness.entries(id).len(), entries.len());
}

#[test]
fn fail_fail_pass_succeeds_on_third_attempt() {
    let harness = Harness::new(vec![ScriptedCheck::sequence(
        "ci",
        vec![false, false, true],
    )]);
    let orch = harness.orchestrator();
    let id = orch
        .start(Feature::new("add retry jitter"))
        .expect("start")
        .session_id;

    let mut states = Vec::new();
    let outcome = run_to_completion(&orch, id, |s| states.push(s.state)).expect("run");
    assert_eq!(outcome.status.state, SessionState::Succeeded);
    assert_eq!(outcome.status.retry_count, 2);
    assert_eq!(
        states,
        vec![
            SessionState::Implementing,
            SessionState::Validating,
            SessionState::Iterating,
            SessionState::Implementing,
            SessionState::Validating,
            SessionState::Iterating,
            SessionState::Implementing,
            SessionState::Validating,
            SessionState::Succeeded,
        ]
    );
    assert_eq!(count(&harness.entries(id), LogKind::ValidationResult), 3);
}

#[test]
fn sandbox_violation_aborts_immediately() {
    let harness = Harness::new(vec![ScriptedCheck::always_passing("ci")]);
    harness.model.push(plan("add retry jitter"));
    harness.model.push(implementation(
        "escape",
        vec![
            tool_call(
                "write_file",
                json!({"path": "../outside.txt", "content": "x"}),
            ),
            tool_call("echo", json!({"text": "never runs"})),
        ],
    ));
    let orch = harness.orchestrator();
    let id = orch
        .start(Feature::new("add retry jitter"))
        .expect("start")
        .session_id;

    orch.advance(id).expect("plan");
    let status = orch.advance(id).expect("implement");
    assert_eq!(status.state, SessionState::Aborted);
    assert!(
        status
            .terminal_reason
            .as_deref()
            .unwrap_or("")
            .contains("sandbox violation")
    );
    assert!(!harness.workdir.join("../outside.txt").exists());

    let entries = harness.entries(id);
    assert_contiguous(&entries);
    assert_eq!(count(&entries, LogKind::ToolInvocation), 1);
    assert_eq!(count(&entries, LogKind::ValidationResult), 0);
    assert_eq!(entries.last().map(|e| e.kind), Some(LogKind::Abort));
    assert!(orch.advance(id).is_err());
}

#[test]
fn unknown_tool_is_recorded_and_session_continues() {
    let harness = Harness::new(vec![ScriptedCheck::always_passing("ci")]);
    harness.model.push(plan("add retry jitter"));
    harness.model.push(implementation(
        "mixed",
        vec![
            tool_call("teleport", json!({})),
            tool_call(
                "write_file",
                json!({"path": "src/retry.rs", "content": "// jitter\n"}),
            ),
        ],
    ));
    let orch = harness.orchestrator();
    let id = orch
        .start(Feature::new("add retry jitter"))
        .expect("start")
        .session_id;

    let outcome = run_to_completion(&orch, id, |_| {}).expect("run");
    assert_eq!(outcome.status.state, SessionState::Succeeded);
    assert!(harness.workdir.join("src/retry.rs").is_file());

    let outcomes: Vec<ToolOutcome> = harness
        .entries(id)
        .iter()
        .filter_map(|e| match e.record().expect("record") {
            LogRecord::ToolInvocation(result) => Some(result.outcome),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes, vec![ToolOutcome::NotFound, ToolOutcome::Succeeded]);
}

#[test]
fn abort_during_tool_call_stops_the_session() {
    let harness = Harness::new(vec![ScriptedCheck::always_passing("ci")]);
    harness.model.push(plan("add retry jitter"));
    harness.model.push(implementation(
        "slow",
        vec![tool_call("sleep", json!({"millis": 10_000}))],
    ));
    let orch = harness.orchestrator();
    let id = orch
        .start(Feature::new("add retry jitter"))
        .expect("start")
        .session_id;
    orch.advance(id).expect("plan");

    let started = Instant::now();
    let status = thread::scope(|scope| {
        let worker = scope.spawn(|| orch.advance(id));
        while harness.model.calls().len() < 2 {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(150));
        orch.abort(id, "operator abort").expect("abort");
        worker.join().expect("join")
    });
    assert!(started.elapsed() < Duration::from_secs(8));
    let status = status.expect("advance");
    assert_eq!(status.state, SessionState::Aborted);
    assert_eq!(status.terminal_reason.as_deref(), Some("operator abort"));

    let entries = harness.entries(id);
    assert_contiguous(&entries);
    assert_eq!(count(&entries, LogKind::Abort), 1);
    let timed_out = entries.iter().any(|e| {
        matches!(
            e.record().expect("record"),
            LogRecord::ToolInvocation(r) if r.outcome == ToolOutcome::TimedOut
        )
    });
    assert!(timed_out);
}

#[test]
fn storage_failure_aborts_and_flags_the_session() {
    let harness = Harness::new(vec![ScriptedCheck::always_passing("ci")]);
    let store = Arc::new(FailingStore::after(Arc::clone(&harness.store), 2));
    let orch = harness.orchestrator_with(store);
    let id = orch
        .start(Feature::new("add retry jitter"))
        .expect("start")
        .session_id;

    let err = orch.advance(id).unwrap_err();
    assert!(matches!(err, OrchestratorError::Storage { .. }));
    let status = orch.status(id).expect("status");
    assert_eq!(status.state, SessionState::Aborted);
    assert!(status.flagged_for_inspection);
    assert!(matches!(
        orch.advance(id).unwrap_err(),
        OrchestratorError::InvalidTransition { .. }
    ));
    // Creation and planning made it to disk; nothing after.
    assert_eq!(harness.entries(id).len(), 2);
}

#[test]
fn context_bundle_respects_cap_and_prefers_related_sessions() {
    let mut harness = Harness::new(vec![ScriptedCheck::always_passing("ci")]);
    harness.settings.context.max_entries = 2;
    let orch = harness.orchestrator();
    for description in [
        "add retry limit to http client",
        "add retry jitter to http client",
        "rename css classes",
    ] {
        let id = orch
            .start(Feature::new(description))
            .expect("start")
            .session_id;
        run_to_completion(&orch, id, |_| {}).expect("run");
    }

    let id = orch
        .start(Feature::new("add retry backoff to http client"))
        .expect("start")
        .session_id;
    orch.advance(id).expect("plan");

    let calls = harness.model.calls();
    let planning = calls
        .iter()
        .rfind(|c| c.phase == ModelPhase::Planning)
        .expect("planning call");
    assert!(planning.context.items.len() <= 2);
    assert!(!planning.context.items.is_empty());
    assert!(planning.context.dropped > 0);
    assert!(
        planning
            .context
            .items
            .iter()
            .all(|item| item.feature.contains("retry"))
    );
}

#[test]
fn session_is_rehydrated_by_a_new_orchestrator() {
    let harness = Harness::new(vec![ScriptedCheck::always_passing("ci")]);
    let id = {
        let orch = harness.orchestrator();
        let id = orch
            .start(Feature::new("add retry jitter"))
            .expect("start")
            .session_id;
        orch.advance(id).expect("plan");
        id
    };

    let orch = harness.orchestrator();
    let status = orch.status(id).expect("status");
    assert_eq!(status.state, SessionState::Implementing);
    assert_eq!(status.attempts, 1);

    let outcome = run_to_completion(&orch, id, |_| {}).expect("run");
    assert_eq!(outcome.status.state, SessionState::Succeeded);
    assert_contiguous(&harness.entries(id));
}

#[test]
fn concurrent_advances_of_one_session_run_one_phase_each() {
    let harness = Harness::new(vec![ScriptedCheck::always_passing("ci")]);
    harness.model.push(plan("add retry jitter"));
    harness.model.push(implementation(
        "slow edit",
        vec![tool_call("sleep", json!({"millis": 300}))],
    ));
    let orch = harness.orchestrator();
    let id = orch
        .start(Feature::new("add retry jitter"))
        .expect("start")
        .session_id;
    orch.advance(id).expect("plan");
    let before = transitions(&harness.entries(id)).len();

    let barrier = Barrier::new(2);
    let mut states: Vec<SessionState> = thread::scope(|scope| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    orch.advance(id).expect("advance").state
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("join"))
            .collect()
    });
    states.sort_by_key(|s| s.as_str());
    assert_eq!(states, vec![SessionState::Succeeded, SessionState::Validating]);

    let entries = harness.entries(id);
    assert_contiguous(&entries);
    let edges: Vec<(Option<SessionState>, SessionState)> = transitions(&entries)[before..]
        .iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        edges,
        vec![
            (Some(SessionState::Implementing), SessionState::Validating),
            (Some(SessionState::Validating), SessionState::Succeeded),
        ]
    );
    assert_eq!(count(&entries, LogKind::ToolInvocation), 1);
    assert_eq!(count(&entries, LogKind::ValidationResult), 1);
    assert_eq!(harness.checks[0].runs(), 1);
    let implementation_calls = harness
        .model
        .calls()
        .iter()
        .filter(|c| c.phase == ModelPhase::Implementation)
        .count();
    assert_eq!(implementation_calls, 1);

    assert!(matches!(
        orch.advance(id).unwrap_err(),
        OrchestratorError::InvalidTransition {
            state: SessionState::Succeeded,
            ..
        }
    ));
    assert_eq!(harness.entries(id).len(), entries.len());
}
