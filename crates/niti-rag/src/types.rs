//! Core data model: policy documents, passages, conversation turns, and
//! retrieval/answer types shared across the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::text::slugify;

// ============================================================================
// Policy documents (ingestion input)
// ============================================================================

/// A structured policy document as supplied by the upstream scraper or
/// uploader. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Stable identifier derived from the title; the wire schema carries none.
    #[serde(default)]
    pub document_id: String,
    pub title: String,
    pub source_url: String,
    pub sections: Vec<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_date: Option<String>,
}

impl PolicyDocument {
    pub fn new(
        title: impl Into<String>,
        source_url: impl Into<String>,
        sections: Vec<Section>,
    ) -> Self {
        let title = title.into();
        let document_id = slugify(&title);
        Self {
            document_id,
            title,
            source_url: source_url.into(),
            sections,
            approval_date: None,
            review_date: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub section_title: String,
    pub clauses: Vec<Clause>,
}

/// The atomic unit of policy meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clause {
    pub clause_label: String,
    pub text: String,
}

// ============================================================================
// Passages (indexed units)
// ============================================================================

/// One indexed unit of policy text: a clause, or a merged short-clause group.
/// The index generation holds its vector in 1:1 correspondence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    /// Unique across the index, stable per document + clause.
    pub passage_id: String,
    pub document_id: String,
    pub document_title: String,
    /// 1-based position of the section within its document.
    pub section_index: usize,
    pub section_title: String,
    pub clause_label: String,
    pub text: String,
}

impl Passage {
    /// The exact citation identifier the model must emit for this passage.
    pub fn citation_label(&self) -> String {
        format!(
            "[{}, Clause {}, Section {}]",
            self.document_title, self.clause_label, self.section_index
        )
    }
}

// ============================================================================
// Conversation turns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One recorded query/answer exchange half. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub cited_passage_ids: HashSet<String>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            timestamp: Utc::now(),
            cited_passage_ids: HashSet::new(),
        }
    }

    pub fn assistant(text: impl Into<String>, cited_passage_ids: HashSet<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
            cited_passage_ids,
        }
    }
}

// ============================================================================
// Retrieval
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub passage_id: String,
    /// Cosine similarity via inner product of unit vectors.
    pub score: f32,
    /// 1-based rank within the result list.
    pub rank: usize,
}

/// Transient per-query retrieval state handed from the gate to the prompt
/// builder and validator. `passages[i]` corresponds to `top_k_results[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalContext {
    pub resolved_query_text: String,
    pub top_k_results: Vec<RetrievalResult>,
    pub above_threshold: bool,
    /// Best score seen, kept even when results are discarded below threshold.
    pub top_score: Option<f32>,
    pub passages: Vec<Passage>,
}

impl RetrievalContext {
    /// Look up a retrieved passage by id.
    pub fn passage(&self, passage_id: &str) -> Option<&Passage> {
        self.passages.iter().find(|p| p.passage_id == passage_id)
    }
}

// ============================================================================
// Engine answers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerKind {
    /// Generated from retrieved passages, citations validated.
    Grounded,
    /// Clarifying question back to the user.
    Clarification,
    /// Polite refusal: nothing relevant enough in the corpus.
    Refusal,
    /// Query outside policy scope (including empty input).
    OutOfScope,
}

/// Reference to a cited passage, carried on the final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationRef {
    pub passage_id: String,
    pub document_title: String,
    pub section_index: usize,
    pub section_title: String,
    pub clause_label: String,
}

impl From<&Passage> for CitationRef {
    fn from(p: &Passage) -> Self {
        Self {
            passage_id: p.passage_id.clone(),
            document_title: p.document_title.clone(),
            section_index: p.section_index,
            section_title: p.section_title.clone(),
            clause_label: p.clause_label.clone(),
        }
    }
}

impl CitationRef {
    pub fn label(&self) -> String {
        format!(
            "[{}, Clause {}, Section {}]",
            self.document_title, self.clause_label, self.section_index
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerMetadata {
    pub duration_ms: u64,
    /// Top retrieval score, when retrieval ran.
    pub top_score: Option<f32>,
    pub passages_considered: usize,
    pub model: Option<String>,
    /// The generation call was retried once after a transient failure.
    pub retried: bool,
    /// Validator notes, e.g. stripped unverifiable sentences.
    pub warnings: Vec<String>,
}

/// Final engine output for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineAnswer {
    pub kind: AnswerKind,
    pub text: String,
    pub citations: Vec<CitationRef>,
    pub metadata: AnswerMetadata,
}

// ============================================================================
// Ingest reporting
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedDocument {
    pub title: String,
    pub reason: String,
}

/// Outcome of one ingest batch. Skipped documents are warnings, not failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub documents_seen: usize,
    pub documents_indexed: usize,
    pub documents_skipped: Vec<SkippedDocument>,
    pub passages: usize,
    pub merged_clauses: usize,
}
