pub mod anthropic;
pub mod extract;
pub mod prompt;
pub mod provider;

pub use prompt::SystemPrompt;
pub use provider::{LlmClient, LlmProvider, LlmRequest, LlmResponse, LlmUsage, Message, ProviderError};
