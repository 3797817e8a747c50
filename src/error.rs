//! Error types for sqlgate.
//!
//! Defines the error enum used throughout the gateway, the policy violation
//! detail carried by security rejections, and the `ErrorKind` tags used by
//! retry sets and structured failure results.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Empty or syntactically invalid SQL.
    #[error("SQL parse error: {0}")]
    Parse(String),

    /// Structurally valid SQL rejected by the security policy.
    #[error("Security violation: {0}")]
    SecurityViolation(Violation),

    /// Language model failures (bad response, auth, transport).
    #[error("LLM error: {0}")]
    Llm(String),

    /// The language model did not answer within its timeout.
    #[error("LLM timeout: {0}")]
    LlmTimeout(String),

    /// Connection-class database failures (lost connection, pool exhausted, etc.)
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Statement-level database failures (unknown relation, type errors, etc.)
    #[error("Database error: {0}")]
    Database(String),

    /// The statement ran past the allowed execution time.
    #[error("Query execution timed out: {0}")]
    ExecutionTimeout(String),

    /// The requested database identifier is not configured.
    #[error("Database '{name}' not found. Available databases: {}", .available.join(", "))]
    NoDatabaseFound { name: String, available: Vec<String> },

    /// A rate limiter refused the call.
    #[error("Rate limit exceeded for {0}")]
    RateLimitExceeded(String),

    /// A circuit breaker is open and refused the call.
    #[error("Circuit breaker open for {0}; failing fast")]
    CircuitOpen(String),

    /// Caller input rejected before any processing.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors (invalid config file, out-of-range values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Creates a parse error with the given message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Creates a security violation error.
    pub fn violation(kind: ViolationKind, identifier: impl Into<String>) -> Self {
        Self::SecurityViolation(Violation::new(kind, identifier))
    }

    /// Creates an LLM error with the given message.
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    /// Creates an LLM timeout error with the given message.
    pub fn llm_timeout(msg: impl Into<String>) -> Self {
        Self::LlmTimeout(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a statement-level database error with the given message.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Creates an execution timeout error with the given message.
    pub fn execution_timeout(msg: impl Into<String>) -> Self {
        Self::ExecutionTimeout(msg.into())
    }

    /// Creates a "database not found" error.
    pub fn no_database(name: impl Into<String>, available: Vec<String>) -> Self {
        Self::NoDatabaseFound {
            name: name.into(),
            available,
        }
    }

    /// Creates a rate limit error naming the limited dependency.
    pub fn rate_limited(dependency: impl Into<String>) -> Self {
        Self::RateLimitExceeded(dependency.into())
    }

    /// Creates a circuit-open error naming the guarded dependency.
    pub fn circuit_open(dependency: impl Into<String>) -> Self {
        Self::CircuitOpen(dependency.into())
    }

    /// Creates an invalid input error with the given message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the kind tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) => ErrorKind::Parse,
            Self::SecurityViolation(_) => ErrorKind::SecurityViolation,
            Self::Llm(_) => ErrorKind::Llm,
            Self::LlmTimeout(_) => ErrorKind::LlmTimeout,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Database(_) => ErrorKind::Database,
            Self::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
            Self::NoDatabaseFound { .. } => ErrorKind::NoDatabaseFound,
            Self::RateLimitExceeded(_) => ErrorKind::RateLimitExceeded,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Config(_) => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        self.kind().category()
    }

    /// Returns the policy violation, if this is a security rejection.
    pub fn as_violation(&self) -> Option<&Violation> {
        match self {
            Self::SecurityViolation(v) => Some(v),
            _ => None,
        }
    }
}

/// Tag identifying a `GatewayError` variant.
///
/// Used for retry sets and for the `error_kind` field of failure results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    SecurityViolation,
    Llm,
    LlmTimeout,
    Connection,
    Database,
    ExecutionTimeout,
    NoDatabaseFound,
    RateLimitExceeded,
    CircuitOpen,
    InvalidInput,
    Config,
    Internal,
}

impl ErrorKind {
    /// Returns a human-readable label for the kind.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Parse => "Parse Error",
            Self::SecurityViolation => "Security Violation",
            Self::Llm => "LLM Error",
            Self::LlmTimeout => "LLM Timeout",
            Self::Connection => "Connection Error",
            Self::Database => "Database Error",
            Self::ExecutionTimeout => "Execution Timeout",
            Self::NoDatabaseFound => "Database Not Found",
            Self::RateLimitExceeded => "Rate Limit Exceeded",
            Self::CircuitOpen => "Circuit Open",
            Self::InvalidInput => "Invalid Input",
            Self::Config => "Configuration Error",
            Self::Internal => "Internal Error",
        }
    }

    /// Returns true if this kind signals an unhealthy external dependency.
    ///
    /// Only these failures move a circuit breaker towards the open state.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::Llm | Self::LlmTimeout | Self::Connection)
    }

    /// Returns true if the failure is the generated SQL's fault and should be
    /// fed back to the model on the next attempt.
    pub fn is_generation_feedback(&self) -> bool {
        matches!(
            self,
            Self::Parse | Self::SecurityViolation | Self::Database | Self::ExecutionTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.category())
    }
}

/// The class of policy rule a statement broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// The statement (or a nested statement) is not a read-only query.
    StatementKind,
    /// The input contained more than one statement.
    MultipleStatements,
    /// EXPLAIN is disabled by policy.
    ExplainNotAllowed,
    BlockedTable,
    BlockedColumn,
    BlockedFunction,
}

/// A single policy violation: what rule was broken and by which identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Offending keyword or identifier, case-folded where it names an object.
    pub identifier: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ViolationKind::StatementKind => write!(
                f,
                "{} statements are not allowed; only SELECT queries are permitted",
                self.identifier
            ),
            ViolationKind::MultipleStatements => {
                write!(f, "Multiple statements are not allowed")
            }
            ViolationKind::ExplainNotAllowed => write!(f, "EXPLAIN statements are not allowed"),
            ViolationKind::BlockedTable => {
                write!(f, "access to blocked table '{}' is not allowed", self.identifier)
            }
            ViolationKind::BlockedColumn => {
                write!(f, "access to blocked column '{}' is not allowed", self.identifier)
            }
            ViolationKind::BlockedFunction => {
                write!(f, "call to blocked function '{}' is not allowed", self.identifier)
            }
        }
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
