//! LLM client factory.
//!
//! Centralizes provider-specific logic for creating LLM clients.

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::{GatewayError, Result};
use crate::llm::{LlmClient, LlmProvider, MockLlmClient, OpenAiClient, OpenAiConfig};

/// Creates an LLM client from the `[llm]` settings.
///
/// The API key must already be resolved on `settings` (config file or
/// `OPENAI_API_KEY`, applied at config load).
pub fn create_client(settings: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match settings.provider {
        LlmProvider::OpenAi => {
            let key = settings
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    GatewayError::config(
                        "No API key configured. Set llm.api_key or OPENAI_API_KEY.",
                    )
                })?;
            let client = OpenAiClient::new(OpenAiConfig::from_settings(settings, key))?;
            Ok(Arc::new(client))
        }
        LlmProvider::Mock => Ok(Arc::new(MockLlmClient::new())),
    }
}
