//! LLM provider abstraction.
//!
//! Providers speak in chat messages; the client wraps one provider with
//! the per-request timeout and a single retry. Everything past that
//! budget surfaces as a service error.

pub mod http;

pub use http::HttpProvider;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling knobs passed through to the provider on every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    /// Model name as reported by the provider, when it reports one.
    pub model: Option<String>,
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChatResponse>;

    fn name(&self) -> &str;
}

/// A completed generation plus whether the retry path fired.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub response: ChatResponse,
    pub retried: bool,
}

/// Wraps a provider with the request timeout and exactly one retry.
pub struct LLMClient {
    provider: Box<dyn LLMProvider>,
    request_timeout: Duration,
}

impl LLMClient {
    pub fn new(provider: Box<dyn LLMProvider>, request_timeout: Duration) -> Self {
        Self {
            provider,
            request_timeout,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Run one generation within the timeout budget. A failed or timed
    /// out attempt is retried once; a second failure is terminal.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<GenerationOutcome, EngineError> {
        match self.attempt(messages, params).await {
            Ok(response) => Ok(GenerationOutcome {
                response,
                retried: false,
            }),
            Err(first) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    error = %first,
                    "Generation attempt failed, retrying once"
                );
                match self.attempt(messages, params).await {
                    Ok(response) => Ok(GenerationOutcome {
                        response,
                        retried: true,
                    }),
                    Err(second) => Err(EngineError::GenerationService(format!(
                        "{} failed twice: {}; retry: {}",
                        self.provider.name(),
                        first,
                        second
                    ))),
                }
            }
        }
    }

    async fn attempt(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChatResponse> {
        match tokio::time::timeout(self.request_timeout, self.provider.generate(messages, params))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "request timed out after {:?}",
                self.request_timeout
            )),
        }
    }
}
