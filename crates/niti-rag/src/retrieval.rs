//! Retrieval Gate: runs the similarity search and applies the query-level
//! relevance threshold, the primary anti-hallucination control.

use crate::config::RetrievalConfig;
use crate::error::EngineError;
use crate::index::{EmbeddingIndex, Generation};
use crate::types::RetrievalContext;

/// True when the best score clears the relevance bar. The threshold gates
/// the query as a whole, never individual passages.
pub fn above_threshold(top_score: Option<f32>, min_similarity: f32) -> bool {
    top_score.is_some_and(|score| score >= min_similarity)
}

pub struct RetrievalGate {
    config: RetrievalConfig,
}

impl RetrievalGate {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    /// Encode the resolved query, search the generation, and gate on the top
    /// score. Below the bar, every result is discarded. Indexes holding fewer
    /// than top_k passages return what they have.
    pub fn retrieve(
        &self,
        index: &EmbeddingIndex,
        generation: &Generation,
        resolved_query_text: &str,
    ) -> Result<RetrievalContext, EngineError> {
        let query_vector = index.encode(resolved_query_text)?;
        let results = generation.search(&query_vector, self.config.top_k)?;
        let top_score = results.first().map(|r| r.score);

        if !above_threshold(top_score, self.config.min_similarity) {
            tracing::info!(
                top_score = top_score.unwrap_or(0.0),
                min_similarity = self.config.min_similarity,
                discarded = results.len(),
                "No sufficiently relevant passages, discarding results"
            );
            return Ok(RetrievalContext {
                resolved_query_text: resolved_query_text.to_string(),
                top_k_results: Vec::new(),
                above_threshold: false,
                top_score,
                passages: Vec::new(),
            });
        }

        let passages = results
            .iter()
            .filter_map(|r| generation.passage(&r.passage_id).cloned())
            .collect();
        tracing::debug!(
            top_score = top_score.unwrap_or(0.0),
            results = results.len(),
            "Query passed the relevance gate"
        );
        Ok(RetrievalContext {
            resolved_query_text: resolved_query_text.to_string(),
            top_k_results: results,
            above_threshold: true,
            top_score,
            passages,
        })
    }
}
