//! Query Resolver: classifies each incoming query as answerable, needing
//! clarification, or out of scope, and fuses short follow-ups with recent
//! conversation context so they retrieve against the right passages.

use serde::{Deserialize, Serialize};

use crate::index::Generation;
use crate::text::{content_tokens, tokenize, truncate_chars};
use crate::types::{ConversationTurn, TurnRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Answerable,
    NeedsClarification,
    OutOfScope,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    /// What the retrieval gate should actually search for.
    pub resolved_query_text: String,
    /// Prior-turn context was merged into the resolved query.
    pub used_context: bool,
}

// ============================================================================
// Heuristics seam
// ============================================================================

/// Fuzzy classification rules, kept behind a trait so the keyword rules can
/// be swapped for a learned classifier without touching retrieval or prompt
/// logic.
pub trait QueryHeuristics: Send + Sync {
    /// Short follow-up that needs prior-turn context to retrieve well.
    fn is_follow_up(&self, query: &str) -> bool;

    /// Broad, open-ended phrasing with nothing concrete to anchor retrieval.
    fn is_open_ended(&self, query: &str) -> bool;

    /// The query names a policy-domain concept directly.
    fn has_domain_noun(&self, query: &str) -> bool;
}

const ANAPHORIC_TOKENS: &[&str] = &["it", "that", "this", "these", "those", "they"];

const OPEN_ENDED_LEADS: &[&str] = &[
    "tell me about",
    "tell me more",
    "what should",
    "what can you",
    "anything else",
    "more info",
    "help",
];

const DOMAIN_NOUNS: &[&str] = &[
    "policy",
    "policies",
    "clause",
    "clauses",
    "section",
    "sections",
    "procedure",
    "procedures",
    "regulation",
    "regulations",
    "assessment",
    "assessments",
    "misconduct",
    "plagiarism",
    "appeal",
    "appeals",
    "extension",
    "extensions",
    "enrolment",
    "enrollment",
    "admission",
    "admissions",
    "integrity",
];

pub struct KeywordHeuristics {
    max_follow_up_words: usize,
}

impl KeywordHeuristics {
    pub fn new() -> Self {
        Self {
            max_follow_up_words: 5,
        }
    }
}

impl Default for KeywordHeuristics {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryHeuristics for KeywordHeuristics {
    fn is_follow_up(&self, query: &str) -> bool {
        let tokens = tokenize(query);
        tokens.len() <= self.max_follow_up_words
            || tokens
                .iter()
                .any(|t| ANAPHORIC_TOKENS.contains(&t.as_str()))
    }

    fn is_open_ended(&self, query: &str) -> bool {
        if content_tokens(query).len() <= 1 {
            return true;
        }
        let lower = query.to_lowercase();
        OPEN_ENDED_LEADS.iter().any(|lead| lower.contains(lead))
    }

    fn has_domain_noun(&self, query: &str) -> bool {
        tokenize(query)
            .iter()
            .any(|t| DOMAIN_NOUNS.contains(&t.as_str()))
    }
}

// ============================================================================
// Resolver
// ============================================================================

pub struct QueryResolver {
    heuristics: Box<dyn QueryHeuristics>,
}

impl QueryResolver {
    pub fn new() -> Self {
        Self {
            heuristics: Box::new(KeywordHeuristics::new()),
        }
    }

    pub fn with_heuristics(heuristics: Box<dyn QueryHeuristics>) -> Self {
        Self { heuristics }
    }

    /// Classify the query against the active generation and recent history,
    /// producing the text the retrieval gate should search for.
    pub fn resolve(
        &self,
        raw_query: &str,
        history: &[ConversationTurn],
        generation: &Generation,
    ) -> Resolution {
        let trimmed = raw_query.trim();
        if trimmed.is_empty() {
            tracing::debug!("Empty query resolved as out of scope");
            return Resolution {
                outcome: ResolutionOutcome::OutOfScope,
                resolved_query_text: String::new(),
                used_context: false,
            };
        }

        let mut resolved = trimmed.to_string();
        let mut used_context = false;
        if self.heuristics.is_follow_up(trimmed) {
            if let Some(fused) = fuse_with_history(trimmed, history, generation) {
                tracing::debug!(
                    raw = %trimmed,
                    fused_len = fused.len(),
                    "Short follow-up fused with prior turn context"
                );
                resolved = fused;
                used_context = true;
            }
        }

        let matches_topic = content_tokens(&resolved)
            .iter()
            .any(|t| generation.contains_topic(t));
        if !matches_topic
            && !self.heuristics.has_domain_noun(trimmed)
            && self.heuristics.is_open_ended(trimmed)
        {
            tracing::debug!(query = %trimmed, "Query resolved as needing clarification");
            return Resolution {
                outcome: ResolutionOutcome::NeedsClarification,
                resolved_query_text: resolved,
                used_context,
            };
        }

        Resolution {
            outcome: ResolutionOutcome::Answerable,
            resolved_query_text: resolved,
            used_context,
        }
    }
}

impl Default for QueryResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge the most recent user turn and the passages cited by the most recent
/// answer into the query text. Returns None when there is nothing to fuse.
fn fuse_with_history(
    query: &str,
    history: &[ConversationTurn],
    generation: &Generation,
) -> Option<String> {
    let last_user = history
        .iter()
        .rev()
        .find(|t| t.role == TurnRole::User && !t.text.trim().is_empty())?;

    let mut parts = vec![last_user.text.trim().to_string()];
    if let Some(last_answer) = history.iter().rev().find(|t| t.role == TurnRole::Assistant) {
        let mut cited: Vec<&String> = last_answer.cited_passage_ids.iter().collect();
        cited.sort();
        for passage_id in cited {
            if let Some(passage) = generation.passage(passage_id) {
                parts.push(truncate_chars(&passage.text, 200).to_string());
            }
        }
    }
    parts.push(query.to_string());
    Some(parts.join(" "))
}
