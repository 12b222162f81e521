//! Feature scope guard: decides whether a request is one boundable feature.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::relevance::keywords;
use crate::core::types::Feature;

/// Verdict of a scope check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum ScopeDecision {
    Approved,
    Rejected(String),
    /// The request bundles several changes; these are the proposed parts.
    Split(Vec<Feature>),
}

impl ScopeDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Pluggable scope predicate. Any `Fn(&Feature) -> ScopeDecision` qualifies.
pub trait ScopeGuard: Send + Sync {
    fn check(&self, request: &Feature) -> ScopeDecision;
}

impl<F> ScopeGuard for F
where
    F: Fn(&Feature) -> ScopeDecision + Send + Sync,
{
    fn check(&self, request: &Feature) -> ScopeDecision {
        self(request)
    }
}

/// Verbs that open an independent change when they start a clause.
const ACTION_VERBS: &[&str] = &[
    "add",
    "build",
    "create",
    "delete",
    "extract",
    "fix",
    "implement",
    "introduce",
    "migrate",
    "move",
    "optimize",
    "redesign",
    "refactor",
    "remove",
    "rename",
    "replace",
    "rewrite",
    "support",
    "upgrade",
];

static CLAUSE_SPLIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:[;,]|\b(?:and then|and|then|also|plus|as well as)\b)\s*")
        .expect("clause split regex is valid")
});

/// Default guard: splits a request on conjunctions and counts the clauses that
/// start with an action verb.
#[derive(Debug, Clone)]
pub struct HeuristicScopeGuard {
    pub max_description_chars: usize,
    /// Requests with more independent changes than this are rejected outright.
    pub max_split: usize,
}

impl Default for HeuristicScopeGuard {
    fn default() -> Self {
        Self {
            max_description_chars: 500,
            max_split: 4,
        }
    }
}

impl ScopeGuard for HeuristicScopeGuard {
    fn check(&self, request: &Feature) -> ScopeDecision {
        let description = request.description.trim();
        if description.is_empty() {
            return ScopeDecision::Rejected("feature description is empty".to_string());
        }
        let chars = description.chars().count();
        if chars > self.max_description_chars {
            return ScopeDecision::Rejected(format!(
                "feature description is {chars} characters (limit {}); narrow it down",
                self.max_description_chars
            ));
        }

        let clauses = action_clauses(description);
        match clauses.len() {
            0 | 1 => ScopeDecision::Approved,
            n if n > self.max_split => ScopeDecision::Rejected(format!(
                "request bundles {n} independent changes; submit them separately"
            )),
            _ => ScopeDecision::Split(
                clauses
                    .iter()
                    .map(|clause| Feature {
                        description: clause.clone(),
                        includes: includes_for(clause, &clauses, &request.includes),
                        excludes: request.excludes.clone(),
                        tags: request.tags.clone(),
                    })
                    .collect(),
            ),
        }
    }
}

/// Break a description into clauses, merging pieces that do not start a new
/// action into the clause before them.
fn action_clauses(description: &str) -> Vec<String> {
    let mut clauses: Vec<String> = Vec::new();
    for piece in CLAUSE_SPLIT.split(description) {
        let piece = piece.trim().trim_end_matches('.');
        if piece.is_empty() {
            continue;
        }
        match clauses.last_mut() {
            Some(last) if !is_action_clause(piece) => {
                last.push_str(" and ");
                last.push_str(piece);
            }
            _ => clauses.push(piece.to_string()),
        }
    }
    clauses
}

/// The includes belonging to `clause`: those sharing a keyword with it,
/// plus those matching no clause at all, which every part keeps.
fn includes_for(clause: &str, clauses: &[String], includes: &[String]) -> Vec<String> {
    let own = keywords(clause);
    includes
        .iter()
        .filter(|include| {
            let wanted = keywords(include);
            !wanted.is_disjoint(&own)
                || clauses
                    .iter()
                    .all(|other| wanted.is_disjoint(&keywords(other)))
        })
        .cloned()
        .collect()
}

fn is_action_clause(piece: &str) -> bool {
    let mut words = piece.split_whitespace();
    let Some(first) = words.next() else {
        return false;
    };
    let verb = first.to_lowercase();
    ACTION_VERBS.contains(&verb.as_str()) && words.next().is_some()
}
