//! Language model integration for sqlgate.
//!
//! Provides the client trait, an OpenAI-compatible implementation, a mock for
//! tests, prompt construction and SQL extraction.

pub mod factory;
pub mod mock;
pub mod openai;
pub mod parser;
pub mod prompt;
pub mod types;

pub use factory::create_client;
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, OpenAiConfig};
pub use parser::extract_sql;
pub use prompt::{build_messages, GenerationRequest};
pub use types::{Message, Role};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A chat model that answers a conversation with one reply.
///
/// Transport failures map to `GatewayError::Llm`, timeouts to
/// `GatewayError::LlmTimeout`. Rate limiting, circuit breaking and retries
/// are applied by the caller.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String>;
}

/// Which [`LlmClient`] the factory builds, set by `[llm] provider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI or any OpenAI-compatible endpoint.
    #[default]
    OpenAi,
    /// Canned answers; no API key required.
    Mock,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Mock => "mock",
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
