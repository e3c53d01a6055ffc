pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod prompt;
pub mod resolver;
pub mod retrieval;
pub mod text;
pub mod types;
pub mod validator;

// Re-export primary types for convenience
pub use config::EngineConfig;
pub use engine::PolicyEngine;
pub use error::EngineError;
pub use types::{
    AnswerKind, CitationRef, Clause, ConversationTurn, EngineAnswer, IngestReport, Passage,
    PolicyDocument, RetrievalContext, RetrievalResult, Section, TurnRole,
};

// Re-export LLM boundary types
pub use llm::{
    ChatMessage, ChatResponse, ChatRole, GenerationParams, HttpProvider, LLMClient, LLMProvider,
};

// Re-export common types
pub use anyhow::{Error, Result};
pub use uuid::Uuid;
