//! HTTP clients for the completion and embedding providers.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

use super::types::{
    ChatRole, CompletionRequest, CompletionResponse, TokenUsage, EMBEDDING_DIM,
};
use super::{CompletionClient, EmbeddingClient};

/// Configuration shared by the provider clients.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Max retries on failure
    pub max_retries: u32,
}

impl LlmClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 30,
            max_retries: 1,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

/// Messages-API completion client.
pub struct HttpCompletionClient {
    config: LlmClientConfig,
    http: Client,
}

impl HttpCompletionClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";
    const DEFAULT_MODEL: &'static str = "claude-3-5-sonnet-20241022";

    pub fn new(config: LlmClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());

        let messages: Vec<ApiMessage> = request
            .messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "assistant".to_string(),
                },
                content: m.content.clone(),
            })
            .collect();

        let api_request = ApiRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system.clone(),
            temperature: request.temperature,
        };

        let url = format!("{}/v1/messages", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(self.config.timeout_secs * 1000)
                } else {
                    Error::Llm(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Llm(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiError>(&body) {
                return Err(Error::Llm(format!(
                    "provider error ({}): {}",
                    error.error.error_type, error.error.message
                )));
            }
            return Err(Error::Llm(format!("provider error ({}): {}", status, body)));
        }

        let api_response: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Llm(format!("failed to parse response: {}", e)))?;

        let content = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_ref())
            .cloned()
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content,
            usage: TokenUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
            },
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            match self.complete_once(&request).await {
                Ok(response) => return Ok(response),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Llm("no attempts made".into())))
    }
}

// Provider API types
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    id: String,
    model: String,
    content: Vec<ApiContent>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ApiContent {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

/// Embeddings-API client. Failures do not retry beyond the single built-in
/// retry; the caller's fallback path is authoritative.
pub struct HttpEmbeddingClient {
    config: LlmClientConfig,
    http: Client,
}

impl HttpEmbeddingClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";
    const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    pub fn new(config: LlmClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(Self::DEFAULT_MODEL)
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>> {
        let api_request = EmbeddingApiRequest {
            model: self.model().to_string(),
            input: vec![text.to_string()],
        };

        let url = format!("{}/v1/embeddings", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(self.config.timeout_secs * 1000)
                } else {
                    Error::Embedding(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Embedding(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Embedding(format!(
                "provider error ({}): {}",
                status, body
            )));
        }

        let api_response: EmbeddingApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Embedding(format!("failed to parse response: {}", e)))?;

        let vector = api_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::Embedding("no embedding in response".into()))?;

        if vector.len() != EMBEDDING_DIM {
            return Err(Error::Embedding(format!(
                "expected {} dimensions, got {}",
                EMBEDDING_DIM,
                vector.len()
            )));
        }

        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match self.embed_once(text).await {
            Ok(vector) => Ok(vector),
            // Single retry, then the caller's fallback takes over.
            Err(_) => self.embed_once(text).await,
        }
    }

    fn model_name(&self) -> &str {
        self.model()
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingApiRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingApiData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = LlmClientConfig::new("test-key")
            .with_base_url("https://llm.internal")
            .with_default_model("claude-3-5-haiku-20241022")
            .with_timeout(15)
            .with_max_retries(2);

        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.base_url, Some("https://llm.internal".to_string()));
        assert_eq!(config.timeout_secs, 15);
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn test_embedding_model_default() {
        let client = HttpEmbeddingClient::new(LlmClientConfig::new("k"));
        assert_eq!(client.model_name(), "text-embedding-3-small");
    }
}
