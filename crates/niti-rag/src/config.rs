use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub ingest: IngestConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub dimension: usize,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Clauses shorter than this (estimated tokens) merge into the next
    /// clause of the same section.
    pub min_clause_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// The top result must reach this score or the whole query is refused.
    pub min_similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Ring buffer capacity per session.
    pub max_turns: usize,
    /// How many recent turns the prompt builder includes.
    pub prompt_window: usize,
}

impl EngineConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.embedding.cache_size == 0 {
            return Err("embedding.cache_size must be > 0".into());
        }
        if self.retrieval.top_k == 0 {
            return Err("retrieval.top_k must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_similarity) {
            return Err("retrieval.min_similarity must be in [0.0, 1.0]".into());
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err("generation.temperature must be in [0.0, 2.0]".into());
        }
        if !(0.0..=1.0).contains(&self.generation.top_p) || self.generation.top_p == 0.0 {
            return Err("generation.top_p must be in (0.0, 1.0]".into());
        }
        if self.generation.max_tokens == 0 {
            return Err("generation.max_tokens must be > 0".into());
        }
        if self.generation.request_timeout_secs == 0 {
            return Err("generation.request_timeout_secs must be > 0".into());
        }
        if self.memory.max_turns == 0 {
            return Err("memory.max_turns must be > 0".into());
        }
        if self.memory.prompt_window == 0 {
            return Err("memory.prompt_window must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file; missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("niti-rag");

        Self {
            data_dir,
            embedding: EmbeddingConfig::default(),
            ingest: IngestConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            cache_size: 1000,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_clause_tokens: 8,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 6,
            min_similarity: 0.35,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.9,
            max_tokens: 4096,
            request_timeout_secs: 60,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            prompt_window: 6,
        }
    }
}
