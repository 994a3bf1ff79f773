use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pulse_core::types::MessageRole;

use crate::prompt::SystemPrompt;

/// A single message in the conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub system: SystemPrompt,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

/// Token accounting, including prompt-cache reads and writes.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LlmUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read: u32,
    pub cache_creation: u32,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: LlmUsage,
    pub model: String,
    pub stop_reason: String,
}

/// Common interface for LLM backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, req: &LlmRequest) -> Result<LlmResponse, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

/// Single entry point for all model calls, routing by call shape:
/// `fast` for chat-grade work (patrol verdicts, briefing commentary),
/// `deep` for the signal judge and trade reasoning inference.
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    fast_model: String,
    deep_model: String,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, fast_model: String, deep_model: String) -> Self {
        Self {
            provider,
            fast_model,
            deep_model,
        }
    }

    pub async fn fast(
        &self,
        system: SystemPrompt,
        messages: Vec<Message>,
        max_tokens: u32,
    ) -> Result<LlmResponse, ProviderError> {
        self.provider
            .complete(&LlmRequest {
                model: self.fast_model.clone(),
                system,
                messages,
                max_tokens,
            })
            .await
    }

    pub async fn deep(
        &self,
        system: SystemPrompt,
        messages: Vec<Message>,
        max_tokens: u32,
    ) -> Result<LlmResponse, ProviderError> {
        self.provider
            .complete(&LlmRequest {
                model: self.deep_model.clone(),
                system,
                messages,
                max_tokens,
            })
            .await
    }
}
