//! Embedding model boundary. Every vector that leaves this module is
//! L2-normalized, so the inner product of two embeddings equals their
//! cosine similarity.

use anyhow::Result;

pub mod hashed;

pub use hashed::HashedEmbedder;

pub trait EmbeddingModel: Send + Sync {
    /// Embed a search query.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a passage for indexing.
    fn embed_document(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of passages. Output order matches input order.
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_document(t)).collect()
    }

    /// Vector dimensionality (embedding_dim).
    fn dimension(&self) -> usize;
}

/// Scale a vector to unit L2 norm. The zero vector has no direction and is
/// returned unchanged.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
