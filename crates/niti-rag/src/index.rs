//! Embedding Index: immutable build generations behind an atomically swapped
//! handle. Search is exact brute force over the whole generation, so recall
//! is total at this corpus scale and results are reproducible.

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;

use crate::embeddings::{l2_normalize, EmbeddingModel};
use crate::error::EngineError;
use crate::text::content_tokens;
use crate::types::{Passage, RetrievalResult};

// ============================================================================
// Generation: one immutable index build
// ============================================================================

/// One complete index build. `vectors[i]` belongs to `passages[i]`; both are
/// frozen at build time, so a query that holds this generation sees a
/// consistent passage/vector pairing for its whole lifetime.
pub struct Generation {
    version: u64,
    passages: Vec<Passage>,
    vectors: Vec<Vec<f32>>,
    by_id: HashMap<String, usize>,
    topic_terms: HashSet<String>,
}

impl Generation {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.len()
    }

    pub fn passage(&self, passage_id: &str) -> Option<&Passage> {
        self.by_id.get(passage_id).map(|&i| &self.passages[i])
    }

    /// Terms surfaced by the indexed passages (titles and clause text).
    pub fn topic_terms(&self) -> &HashSet<String> {
        &self.topic_terms
    }

    pub fn contains_topic(&self, token: &str) -> bool {
        self.topic_terms.contains(token)
    }

    /// Exact top-k search by inner product. Descending score; ties broken by
    /// ascending passage_id for reproducibility.
    pub fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<RetrievalResult>, EngineError> {
        if self.passages.len() != self.vectors.len() {
            return Err(EngineError::IndexCorrupt {
                passages: self.passages.len(),
                vectors: self.vectors.len(),
            });
        }

        let mut scored: Vec<(f32, &Passage)> = self
            .vectors
            .iter()
            .zip(&self.passages)
            .map(|(vector, passage)| (dot(query_vector, vector), passage))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.passage_id.cmp(&b.1.passage_id))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (score, passage))| RetrievalResult {
                passage_id: passage.passage_id.clone(),
                score,
                rank: i + 1,
            })
            .collect())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ============================================================================
// EmbeddingIndex: the swappable handle
// ============================================================================

pub struct EmbeddingIndex {
    embedder: Arc<dyn EmbeddingModel>,
    active: RwLock<Option<Arc<Generation>>>,
    next_version: AtomicU64,
    // Rebuilds serialize; readers never wait on a build.
    build_lock: Mutex<()>,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            embedder,
            active: RwLock::new(None),
            next_version: AtomicU64::new(1),
            build_lock: Mutex::new(()),
        }
    }

    /// The active generation, or `IndexNotBuilt` before the first build.
    pub fn generation(&self) -> Result<Arc<Generation>, EngineError> {
        self.active.read().clone().ok_or(EngineError::IndexNotBuilt)
    }

    pub fn version(&self) -> Option<u64> {
        self.active.read().as_ref().map(|g| g.version)
    }

    /// Embed a query and normalize it for inner-product search.
    pub fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = self
            .embedder
            .embed_query(text)
            .context("Failed to embed query")?;
        if vector.len() != self.embedder.dimension() {
            return Err(anyhow::anyhow!(
                "embedder returned {} dimensions, expected {}",
                vector.len(),
                self.embedder.dimension()
            ));
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }

    /// Build a new generation from a passage batch and atomically swap it in.
    /// In-flight queries keep the generation they started with.
    pub fn build(&self, passages: Vec<Passage>) -> Result<Arc<Generation>> {
        let _guard = self.build_lock.lock();
        let started = std::time::Instant::now();

        let texts: Vec<&str> = passages.iter().map(|p| p.text.as_str()).collect();
        let mut vectors = self
            .embedder
            .embed_documents(&texts)
            .context("Failed to embed passages")?;

        if vectors.len() != passages.len() {
            return Err(anyhow::Error::new(EngineError::IndexCorrupt {
                passages: passages.len(),
                vectors: vectors.len(),
            }));
        }
        let dimension = self.embedder.dimension();
        for (vector, passage) in vectors.iter_mut().zip(&passages) {
            if vector.len() != dimension {
                return Err(anyhow::anyhow!(
                    "passage {} embedded to {} dimensions, expected {}",
                    passage.passage_id,
                    vector.len(),
                    dimension
                ));
            }
            l2_normalize(vector);
        }

        let mut by_id = HashMap::with_capacity(passages.len());
        let mut topic_terms = HashSet::new();
        for (i, passage) in passages.iter().enumerate() {
            by_id.insert(passage.passage_id.clone(), i);
            topic_terms.extend(content_tokens(&passage.document_title));
            topic_terms.extend(content_tokens(&passage.section_title));
            topic_terms.extend(content_tokens(&passage.text));
        }

        let generation = Arc::new(Generation {
            version: self.next_version.fetch_add(1, atomic::Ordering::Relaxed),
            passages,
            vectors,
            by_id,
            topic_terms,
        });

        *self.active.write() = Some(generation.clone());
        tracing::info!(
            version = generation.version,
            passages = generation.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Index generation built and swapped in"
        );
        Ok(generation)
    }
}
