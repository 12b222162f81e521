//! Relevance scoring between a feature request and past session memory.

use std::collections::BTreeSet;

use crate::core::types::Feature;

/// Pluggable relevance function. Scores are expected in `0.0..=1.0`.
pub trait RelevanceRanker: Send + Sync {
    fn score(&self, request: &Feature, past: &Feature) -> f64;
}

/// Keyword overlap between descriptions plus a bonus for shared tags.
#[derive(Debug, Clone)]
pub struct KeywordRanker {
    pub tag_bonus: f64,
}

impl Default for KeywordRanker {
    fn default() -> Self {
        Self { tag_bonus: 0.25 }
    }
}

impl RelevanceRanker for KeywordRanker {
    fn score(&self, request: &Feature, past: &Feature) -> f64 {
        let query = keywords(&request.description);
        let candidate = keywords(&past.description);
        let overlap = if query.is_empty() {
            0.0
        } else {
            query.intersection(&candidate).count() as f64 / query.len() as f64
        };
        let shared_tag = request
            .tags
            .iter()
            .any(|tag| past.tags.iter().any(|other| other.eq_ignore_ascii_case(tag)));
        let bonus = if shared_tag { self.tag_bonus } else { 0.0 };
        (overlap + bonus).min(1.0)
    }
}

/// Words that carry no topic on their own.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it", "of", "on",
    "or", "the", "then", "this", "to", "with", "add", "fix", "make", "update", "remove",
    "implement", "support", "new",
];

/// Lowercased topic words of `text`, without stopwords or single characters.
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 1)
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}
