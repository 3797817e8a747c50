//! Mock LLM client for testing.
//!
//! Replies come from, in order: a scripted queue, pattern rules matched
//! against the question, then a small set of default rules.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::llm::types::{Message, Role};
use crate::llm::LlmClient;

/// Mock LLM client that returns canned responses.
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String>>>,
    custom_responses: Vec<(String, String)>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    /// Creates a new mock client with default responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response returned by the next unscripted call.
    pub fn then_respond(self, response: impl Into<String>) -> Self {
        self.push(Ok(response.into()))
    }

    /// Queues a failure returned by the next unscripted call.
    pub fn then_fail(self, error: GatewayError) -> Self {
        self.push(Err(error))
    }

    /// Adds a custom response mapping.
    ///
    /// When the question contains `pattern` (case-insensitive), the mock
    /// returns `response`.
    pub fn with_response(
        mut self,
        pattern: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        self.custom_responses
            .push((pattern.into().to_lowercase(), response.into()));
        self
    }

    /// Sleeps before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of completed or failed calls.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages sent on every call so far.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// User message of the most recent call.
    pub fn last_user_prompt(&self) -> Option<String> {
        self.requests()
            .last()
            .map(|messages| extract_user_input(messages))
    }

    fn push(self, entry: Result<String>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(entry);
        self
    }

    fn next_scripted(&self) -> Option<Result<String>> {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn mock_response(&self, input: &str) -> String {
        let question = question_text(input).to_lowercase();

        for (pattern, response) in &self.custom_responses {
            if question.contains(pattern.as_str()) {
                return response.clone();
            }
        }

        if question.contains("count") && question.contains("users") {
            return "```sql\nSELECT COUNT(*) FROM users;\n```".to_string();
        }

        if question.contains("count") && question.contains("orders") {
            return "```sql\nSELECT COUNT(*) FROM orders;\n```".to_string();
        }

        if question.contains("users") {
            return "```sql\nSELECT * FROM users;\n```".to_string();
        }

        "I don't understand that question. Could you please rephrase it?".to_string()
    }
}

/// Extracts the last user message content from a message list.
fn extract_user_input(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Strips retry feedback so pattern rules only see the question and context.
fn question_text(input: &str) -> &str {
    input
        .split("YOUR PREVIOUS ATTEMPT FAILED")
        .next()
        .unwrap_or(input)
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.next_scripted() {
            Some(scripted) => scripted,
            None => Ok(self.mock_response(&extract_user_input(messages))),
        }
    }
}
