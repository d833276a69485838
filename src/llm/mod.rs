//! Chat provider integration.
//!
//! The agent talks to a stateful chat API: each call may name the response
//! it continues from, and the provider keeps the earlier turns server-side.
//! Only the OpenAI Responses API is implemented.

pub mod openai;

pub use openai::OpenAiProvider;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::LlmError;

/// One input message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One call to the provider.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub model: String,
    /// Continuation token from the previous turn, `None` to start fresh.
    pub previous_response_id: Option<String>,
    pub input: Vec<ChatMessage>,
}

/// Provider output for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCompletion {
    pub content: String,
    /// Continuation token for the next turn.
    pub response_id: Option<String>,
    /// Tokens billed for the turn, if the provider reported them.
    pub total_tokens: Option<u64>,
}

/// A stateful chat-completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Short provider name for logs and errors.
    fn name(&self) -> &str;

    async fn complete(&self, turn: ChatTurn) -> Result<ChatCompletion, LlmError>;
}

/// Configuration for creating a chat provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub base_url: String,
}

/// Create a chat provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn ChatProvider>, LlmError> {
    let provider = OpenAiProvider::new(config.api_key.clone(), &config.base_url)?;
    tracing::info!("Using OpenAI Responses API at {}", config.base_url);
    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_provider_constructs_without_network() {
        let config = LlmConfig {
            api_key: SecretString::from("sk-test"),
            base_url: "https://api.openai.com/v1".to_string(),
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn message_constructors_set_role() {
        assert_eq!(ChatMessage::system("x").role, Role::System);
        assert_eq!(ChatMessage::user("y").role.as_str(), "user");
    }
}
