//! LLM client traits, provider implementations, and structured output.

mod breaker;
mod client;
mod schema;
mod types;

pub use breaker::CircuitBreaker;
pub use client::{HttpCompletionClient, HttpEmbeddingClient, LlmClientConfig};
pub use schema::{extract_json, FieldSpec, FieldType, OutputSchema, SchemaViolation};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, TokenUsage, EMBEDDING_DIM,
};

use crate::error::Result;
use async_trait::async_trait;

/// Completion provider used by the planner and reasoning tools.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

/// Embedding provider used by the similarity tool.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a single text. Must return a vector of [`EMBEDDING_DIM`]
    /// dimensions.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Name of the embedding model, recorded alongside stored vectors.
    fn model_name(&self) -> &str;
}
