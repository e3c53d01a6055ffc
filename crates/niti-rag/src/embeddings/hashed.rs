//! Deterministic feature-hashing embedder. Content tokens hash onto a fixed
//! number of buckets with a sign bit; the accumulated vector is L2-normalized.
//! No model files, no network: the same text always encodes to the same
//! vector, which keeps index builds reproducible.

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;

use super::{l2_normalize, EmbeddingModel};
use crate::text::content_tokens;

pub struct HashedEmbedder {
    dimension: usize,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl HashedEmbedder {
    pub fn new(dimension: usize, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            dimension,
            query_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in content_tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl EmbeddingModel for HashedEmbedder {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.query_cache.lock().get(text) {
            return Ok(hit.clone());
        }
        let vector = self.encode(text);
        self.query_cache
            .lock()
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.encode(text))
    }

    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.par_iter().map(|t| self.encode(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
