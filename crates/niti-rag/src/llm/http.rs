//! OpenAI-compatible chat completions provider.
//!
//! Works against any endpoint speaking that shape: OpenAI, OpenRouter,
//! Together, vLLM, or a local llama.cpp/Ollama server.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{ChatMessage, ChatResponse, GenerationParams, LLMProvider};

pub struct HttpProvider {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    client: Client,
}

impl HttpProvider {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .tcp_nodelay(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            client,
        })
    }

    /// Parse a response body as JSON, returning a clear error if the
    /// server sent back an HTML error page instead.
    async fn parse_json_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body from {}: {}", endpoint, e))?;
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(anyhow!(
                "Endpoint {} returned HTML instead of JSON (HTTP {}), service may be down. Response: {}",
                endpoint,
                status,
                preview
            ));
        }
        serde_json::from_str::<T>(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            anyhow!(
                "Failed to parse JSON from {} (HTTP {}): {}. Body: {}",
                endpoint,
                status,
                e,
                preview
            )
        })
    }
}

#[async_trait]
impl LLMProvider for HttpProvider {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChatResponse> {
        let request = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stream": false
        });

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow!("Request to {} timed out", self.endpoint)
            } else if e.is_connect() {
                anyhow!("Failed to connect to {}: {}", self.endpoint, e)
            } else {
                anyhow!("Request to {} failed: {}", self.endpoint, e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(anyhow!("API error ({}): {}", status, error));
        }

        let result: CompletionsResponse =
            Self::parse_json_response(response, &self.endpoint).await?;
        let content = result
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow!("Endpoint returned an empty choices array"))?;

        Ok(ChatResponse {
            content,
            model: result.model,
        })
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

#[derive(Deserialize)]
struct CompletionsResponse {
    choices: Vec<CompletionsChoice>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct CompletionsChoice {
    message: CompletionsMessage,
}

#[derive(Deserialize)]
struct CompletionsMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params() -> GenerationParams {
        GenerationParams {
            temperature: 0.2,
            top_p: 0.9,
            max_tokens: 128,
        }
    }

    #[tokio::test]
    async fn test_generate_parses_completions_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "test-model",
                "choices": [
                    {"message": {"role": "assistant", "content": "Granted for seven days."}}
                ]
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(
            format!("{}/v1/chat/completions", server.uri()),
            "test-model",
            None,
        )
        .expect("provider builds");

        let response = provider
            .generate(&[ChatMessage::user("how long?")], &params())
            .await
            .expect("generates");
        assert_eq!(response.content, "Granted for seven days.");
        assert_eq!(response.model.as_deref(), Some("test-model"));
    }

    #[tokio::test]
    async fn test_api_key_sent_as_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "ok"}}]
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(
            format!("{}/v1/chat/completions", server.uri()),
            "test-model",
            Some("sk-test".to_string()),
        )
        .expect("provider builds");

        let response = provider
            .generate(&[ChatMessage::user("hi")], &params())
            .await
            .expect("generates");
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn test_error_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(503).set_body_string("upstream overloaded"),
            )
            .mount(&server)
            .await;

        let provider = HttpProvider::new(
            format!("{}/v1/chat/completions", server.uri()),
            "test-model",
            None,
        )
        .expect("provider builds");

        let err = provider
            .generate(&[ChatMessage::user("hi")], &params())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_html_error_page_is_reported_clearly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<!DOCTYPE html><html><body>Bad gateway</body></html>",
                "text/html",
            ))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(
            format!("{}/v1/chat/completions", server.uri()),
            "test-model",
            None,
        )
        .expect("provider builds");

        let err = provider
            .generate(&[ChatMessage::user("hi")], &params())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("HTML instead of JSON"));
    }

    #[tokio::test]
    async fn test_empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(
            format!("{}/v1/chat/completions", server.uri()),
            "test-model",
            None,
        )
        .expect("provider builds");

        let err = provider
            .generate(&[ChatMessage::user("hi")], &params())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("empty choices"));
    }
}
