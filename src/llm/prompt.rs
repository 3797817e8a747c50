//! Prompt construction for SQL generation.
//!
//! Builds the system prompt with schema context and the user message with the
//! question, optional context, and feedback from a failed previous attempt.

use crate::db::SchemaSnapshot;
use crate::llm::types::Message;
use std::sync::Arc;

/// System prompt template for SQL generation.
const SYSTEM_PROMPT_TEMPLATE: &str = r#"You are a PostgreSQL expert. Translate the user's question into a single read-only SQL query.

DATABASE SCHEMA:
{schema}

RULES:
- Generate exactly one SELECT statement (a WITH clause is fine)
- Never modify data or schema: no INSERT, UPDATE, DELETE, DROP, ALTER, CREATE, TRUNCATE
- Use only the tables and columns listed in the schema
- Use appropriate JOINs based on foreign keys
- Prefer explicit column lists over SELECT *

OUTPUT FORMAT:
Return the SQL query wrapped in a ```sql code block, with no other code blocks."#;

/// Everything needed for one generation attempt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question: String,
    pub schema: Arc<SchemaSnapshot>,
    /// Free-text hints from the caller.
    pub context: Option<String>,
    /// SQL produced by the failed previous attempt.
    pub previous_sql: Option<String>,
    /// Exact error text from the failed previous attempt.
    pub error_feedback: Option<String>,
}

impl GenerationRequest {
    pub fn new(question: impl Into<String>, schema: Arc<SchemaSnapshot>) -> Self {
        Self {
            question: question.into(),
            schema,
            context: None,
            previous_sql: None,
            error_feedback: None,
        }
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context.filter(|c| !c.trim().is_empty());
        self
    }

    /// Attaches the failed attempt so the model can correct it.
    pub fn with_feedback(mut self, previous_sql: Option<String>, error: impl Into<String>) -> Self {
        self.previous_sql = previous_sql;
        self.error_feedback = Some(error.into());
        self
    }

    pub fn is_retry(&self) -> bool {
        self.error_feedback.is_some()
    }
}

/// Builds the system prompt with the schema text bounded to `max_schema_chars`.
pub fn build_system_prompt(schema: &SchemaSnapshot, max_schema_chars: usize) -> String {
    let schema_text = schema.format_for_prompt(max_schema_chars);
    SYSTEM_PROMPT_TEMPLATE.replace("{schema}", schema_text.trim_end())
}

/// Builds the user message: question, context, then retry feedback.
pub fn build_user_prompt(request: &GenerationRequest) -> String {
    let mut prompt = format!("QUESTION:\n{}\n", request.question.trim());

    if let Some(context) = &request.context {
        prompt.push_str(&format!("\nADDITIONAL CONTEXT:\n{}\n", context.trim()));
    }

    if let Some(error) = &request.error_feedback {
        prompt.push_str("\nYOUR PREVIOUS ATTEMPT FAILED.\n");
        if let Some(sql) = &request.previous_sql {
            prompt.push_str(&format!("Previous SQL:\n```sql\n{}\n```\n", sql.trim()));
        }
        prompt.push_str(&format!("Error:\n{}\n", error.trim()));
        prompt.push_str(
            "Write a corrected query that avoids this error. Do not repeat the same SQL.\n",
        );
    }

    prompt
}

/// Builds the complete message list for one generation attempt.
pub fn build_messages(request: &GenerationRequest, max_schema_chars: usize) -> Vec<Message> {
    vec![
        Message::system(build_system_prompt(&request.schema, max_schema_chars)),
        Message::user(build_user_prompt(request)),
    ]
}
