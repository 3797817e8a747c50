//! SQL generation: prompt, model call, extraction.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{GatewayError, Result};
use crate::llm::{build_messages, extract_sql, GenerationRequest, LlmClient};
use crate::resilience::DependencyGuard;

/// Turns a question plus schema into one SQL statement.
#[derive(Clone)]
pub struct SqlGenerator {
    client: Arc<dyn LlmClient>,
    guard: DependencyGuard,
    timeout: Duration,
    max_schema_chars: usize,
}

impl SqlGenerator {
    pub fn new(client: Arc<dyn LlmClient>, guard: DependencyGuard, settings: &LlmConfig) -> Self {
        Self {
            client,
            guard,
            timeout: settings.timeout(),
            max_schema_chars: settings.max_schema_chars,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn guard(&self) -> &DependencyGuard {
        &self.guard
    }

    /// Asks the model for SQL and extracts the statement from its reply.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let response = self.respond(request).await?;
        let sql = extract_sql(&response)?;
        debug!(retry = request.is_retry(), sql = %sql, "Extracted SQL from model response");
        Ok(sql)
    }

    /// Returns the model's raw reply to the prompt built from `request`.
    ///
    /// The call takes an LLM rate-limit token and runs through the LLM
    /// circuit breaker; only transport failures come back as errors.
    pub async fn respond(&self, request: &GenerationRequest) -> Result<String> {
        let messages = build_messages(request, self.max_schema_chars);

        self.guard
            .call(|| async {
                tokio::time::timeout(self.timeout, self.client.complete(&messages))
                    .await
                    .map_err(|_| {
                        GatewayError::llm_timeout(format!(
                            "no response within {}s",
                            self.timeout.as_secs_f64()
                        ))
                    })?
            })
            .await
    }
}

impl std::fmt::Debug for SqlGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlGenerator")
            .field("guard", &self.guard)
            .field("timeout", &self.timeout)
            .field("max_schema_chars", &self.max_schema_chars)
            .finish_non_exhaustive()
    }
}
