//! Engine error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input document. Recorded per document during ingest; the batch continues.
    #[error("failed to ingest document '{title}': {reason}")]
    Ingest { title: String, reason: String },

    /// Query issued before the first successful index build.
    #[error("embedding index has not been built yet")]
    IndexNotBuilt,

    /// No passage scored high enough to ground an answer.
    #[error("no sufficiently relevant passages (top score {top_score:.2}, minimum {min_similarity:.2})")]
    NoRelevantPassages { top_score: f32, min_similarity: f32 },

    /// Resolver could not map the query onto any indexed topic.
    #[error("query is too ambiguous to answer: {query}")]
    AmbiguousQuery { query: String },

    /// External LLM call failed or timed out after the retry budget.
    #[error("generation service unavailable: {0}")]
    GenerationService(String),

    /// Generated text contains a factual sentence without a citation.
    #[error("generated answer is missing citations: {sentence}")]
    MissingCitation { sentence: String },

    /// Citation references a passage outside the current retrieval context.
    #[error("citation does not match any retrieved passage: {citation}")]
    UnknownCitation { citation: String },

    /// Vector/passage count mismatch. Fatal; a forced rebuild is required.
    #[error("index corrupt: {passages} passages but {vectors} vectors")]
    IndexCorrupt { passages: usize, vectors: usize },

    /// Infrastructure failure outside the query taxonomy (embedder, IO).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Everything except index corruption is recoverable within the session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::IndexCorrupt { .. })
    }
}
