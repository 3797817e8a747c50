//! The generate → validate → execute pipeline.
//!
//! [`QueryOrchestrator`] is the single entry point callers use. It never
//! returns an error: every failure ends up in a [`QueryOutcome`] with
//! `success: false`, a message and the error kind.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{self, DatabasePool, SchemaCache, SchemaSnapshot};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::llm::{self, GenerationRequest, LlmClient};
use crate::resilience::{CircuitBreaker, DependencyGuard, RateLimiter, RetryConfig, RetryState};
use crate::safety::SqlValidator;

use super::executor::{ExecutionOutcome, SqlExecutor};
use super::generator::SqlGenerator;

/// What the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnMode {
    /// Execute the statement and return rows.
    #[default]
    Result,
    /// Return the validated SQL without executing it.
    Sql,
}

/// A question plus its optional knobs.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub question: String,
    /// Target database; the first configured one when absent.
    pub database: Option<String>,
    /// Free-text hints passed to the model.
    pub context: Option<String>,
    pub return_mode: ReturnMode,
    /// Overrides the policy's row cap.
    pub max_rows: Option<usize>,
    /// Overrides the policy's execution time limit.
    pub timeout: Option<Duration>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_return_mode(mut self, mode: ReturnMode) -> Self {
        self.return_mode = mode;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

/// Result of one `process_query` call, success or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub success: bool,
    /// Final SQL used; the last generated statement on failure.
    pub sql: String,
    pub rows: Vec<Map<String, JsonValue>>,
    /// Rows returned.
    pub row_count: usize,
    /// Rows produced before truncation.
    pub total_row_count: usize,
    pub execution_time_ms: f64,
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Generation attempts made.
    pub attempts: u32,
}

impl QueryOutcome {
    fn failure(database: &str, sql: Option<String>, error: &GatewayError, attempts: u32) -> Self {
        Self {
            success: false,
            sql: sql.unwrap_or_default(),
            rows: Vec::new(),
            row_count: 0,
            total_row_count: 0,
            execution_time_ms: 0.0,
            database: database.to_string(),
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            attempts,
        }
    }

    fn sql_only(database: &str, sql: String, attempts: u32) -> Self {
        Self {
            success: true,
            sql,
            rows: Vec::new(),
            row_count: 0,
            total_row_count: 0,
            execution_time_ms: 0.0,
            database: database.to_string(),
            error: None,
            error_kind: None,
            attempts,
        }
    }

    fn executed(database: &str, sql: String, outcome: ExecutionOutcome, attempts: u32) -> Self {
        Self {
            success: true,
            sql,
            row_count: outcome.rows.len(),
            total_row_count: outcome.total_row_count,
            rows: outcome.rows,
            execution_time_ms: outcome.execution_time.as_secs_f64() * 1000.0,
            database: database.to_string(),
            error: None,
            error_kind: None,
            attempts,
        }
    }
}

/// How the retry loop reacts to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    /// Regenerate at once with the error as feedback.
    Regenerate,
    /// Sleep per the retry policy, then regenerate.
    Backoff,
    Stop,
}

fn next_step(error: &GatewayError) -> NextStep {
    match error.kind() {
        kind if kind.is_generation_feedback() => NextStep::Regenerate,
        // Connection errors reach here once the executor's own retries ran out.
        ErrorKind::Llm | ErrorKind::LlmTimeout | ErrorKind::Connection => NextStep::Backoff,
        _ => NextStep::Stop,
    }
}

/// Composes generator, validator, executor and schema cache.
#[derive(Debug)]
pub struct QueryOrchestrator {
    order: Vec<String>,
    executors: HashMap<String, SqlExecutor>,
    generator: SqlGenerator,
    validator: SqlValidator,
    schema_cache: SchemaCache,
    retry: RetryConfig,
    max_question_length: usize,
}

impl QueryOrchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Validates `config`, opens every configured pool and creates the LLM
    /// client.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let client = llm::create_client(&config.llm)?;

        let mut pools = Vec::with_capacity(config.databases.len());
        for target in &config.databases {
            info!(database = %target.name, target = %target.display_string(), "Connecting");
            match db::connect(target).await {
                Ok(pool) => pools.push(pool),
                Err(e) => {
                    for pool in &pools {
                        pool.close().await;
                    }
                    return Err(e);
                }
            }
        }

        let mut builder = Self::builder(config).with_llm_client(client);
        for pool in pools {
            builder = builder.with_pool(pool);
        }
        builder.build()
    }

    /// Closes every pool.
    pub async fn close(&self) {
        for name in &self.order {
            if let Some(executor) = self.executors.get(name) {
                executor.pool().close().await;
            }
        }
    }

    /// Configured database names, default first.
    pub fn available_databases(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    /// Answers `question` against `database` (or the default database).
    pub async fn process_query(&self, question: &str, database: Option<&str>) -> QueryOutcome {
        let mut request = QueryRequest::new(question);
        request.database = database.map(str::to_string);
        self.process(request).await
    }

    pub async fn process(&self, request: QueryRequest) -> QueryOutcome {
        let requested = request.database.clone().unwrap_or_default();

        if let Err(e) = self.check_question(&request.question) {
            return QueryOutcome::failure(&requested, None, &e, 0);
        }

        let executor = match self.resolve(request.database.as_deref()) {
            Ok(executor) => executor,
            Err(e) => return QueryOutcome::failure(&requested, None, &e, 0),
        };
        let database = executor.database().to_string();

        let schema = match self.schema_for(executor).await {
            Ok(schema) => schema,
            Err(e) => {
                warn!(database = %database, error = %e, "Schema unavailable");
                return QueryOutcome::failure(&database, None, &e, 0);
            }
        };

        self.run_attempts(&request, executor, schema).await
    }

    async fn run_attempts(
        &self,
        request: &QueryRequest,
        executor: &SqlExecutor,
        schema: Arc<SchemaSnapshot>,
    ) -> QueryOutcome {
        let database = executor.database();
        let mut state = RetryState::new(&self.retry);
        let mut last_sql: Option<String> = None;
        let mut feedback: Option<String> = None;

        loop {
            let attempt = state.begin_attempt();
            let mut generation = GenerationRequest::new(request.question.clone(), schema.clone())
                .with_context(request.context.clone());
            if let Some(error) = &feedback {
                generation = generation.with_feedback(last_sql.clone(), error.clone());
            }

            let (step, error) = match self.generator.respond(&generation).await {
                Err(e) => (next_step(&e), e),
                // An unusable reply is the model's fault, not the transport's.
                Ok(response) => match llm::extract_sql(&response) {
                    Err(e) => (NextStep::Regenerate, e),
                    Ok(sql) => {
                        last_sql = Some(sql.clone());
                        match self.check_and_run(&sql, request, executor).await {
                            Ok(None) => return QueryOutcome::sql_only(database, sql, attempt),
                            Ok(Some(rows)) => {
                                return QueryOutcome::executed(database, sql, rows, attempt)
                            }
                            Err(e) => (next_step(&e), e),
                        }
                    }
                },
            };

            if step == NextStep::Stop || !state.has_remaining(&self.retry) {
                warn!(
                    database,
                    attempts = attempt,
                    error = %error,
                    "Query failed"
                );
                return QueryOutcome::failure(database, last_sql, &error, attempt);
            }

            if step == NextStep::Backoff {
                let error_kind = error.kind();
                let delay = state.record_failure(error, &self.retry);
                warn!(
                    database,
                    attempt,
                    error = %error_kind,
                    delay_ms = delay.as_millis() as u64,
                    "Dependency call failed, backing off"
                );
                tokio::time::sleep(delay).await;
            } else {
                debug!(database, attempt, error = %error, "Regenerating with feedback");
                feedback = Some(error.to_string());
                state.last_error = Some(error);
            }
        }
    }

    /// Validates and, unless only SQL was asked for, executes.
    async fn check_and_run(
        &self,
        sql: &str,
        request: &QueryRequest,
        executor: &SqlExecutor,
    ) -> Result<Option<ExecutionOutcome>> {
        self.validator.validate_or_raise(sql)?;
        match request.return_mode {
            ReturnMode::Sql => Ok(None),
            ReturnMode::Result => executor
                .execute(sql, request.timeout, request.max_rows)
                .await
                .map(Some),
        }
    }

    fn check_question(&self, question: &str) -> Result<()> {
        if question.trim().is_empty() {
            return Err(GatewayError::invalid_input("Question must not be empty"));
        }
        let length = question.chars().count();
        if length > self.max_question_length {
            return Err(GatewayError::invalid_input(format!(
                "Question is {} characters long; the limit is {}",
                length, self.max_question_length
            )));
        }
        Ok(())
    }

    fn resolve(&self, database: Option<&str>) -> Result<&SqlExecutor> {
        let name = match database {
            Some(name) => name,
            None => self
                .order
                .first()
                .map(String::as_str)
                .ok_or_else(|| GatewayError::config("No databases configured"))?,
        };
        self.executors
            .get(name)
            .ok_or_else(|| GatewayError::no_database(name, self.order.clone()))
    }

    async fn schema_for(&self, executor: &SqlExecutor) -> Result<Arc<SchemaSnapshot>> {
        self.schema_cache
            .get_or_refresh(executor.database(), || executor.introspect_schema())
            .await
    }
}

/// Assembles a [`QueryOrchestrator`] from settings plus injected
/// dependencies.
pub struct OrchestratorBuilder {
    config: Config,
    pools: Vec<Arc<dyn DatabasePool>>,
    client: Option<Arc<dyn LlmClient>>,
    llm_guard: Option<DependencyGuard>,
    db_guard: Option<DependencyGuard>,
    schema_cache: Option<SchemaCache>,
}

impl OrchestratorBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            pools: Vec::new(),
            client: None,
            llm_guard: None,
            db_guard: None,
            schema_cache: None,
        }
    }

    /// Adds a pool; the first one added is the default database.
    pub fn with_pool(mut self, pool: Arc<dyn DatabasePool>) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn with_llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_llm_guard(mut self, guard: DependencyGuard) -> Self {
        self.llm_guard = Some(guard);
        self
    }

    /// Uses one guard for every database instead of a breaker per database.
    pub fn with_db_guard(mut self, guard: DependencyGuard) -> Self {
        self.db_guard = Some(guard);
        self
    }

    pub fn with_schema_cache(mut self, cache: SchemaCache) -> Self {
        self.schema_cache = Some(cache);
        self
    }

    /// Checks the settings (but not the database list, which `with_pool`
    /// supplies) and wires everything together.
    pub fn build(self) -> Result<QueryOrchestrator> {
        let config = self.config;
        config.validate_settings()?;
        let client = self
            .client
            .ok_or_else(|| GatewayError::config("No LLM client configured"))?;
        if self.pools.is_empty() {
            return Err(GatewayError::config("At least one database must be configured"));
        }

        let retry = RetryConfig::from_settings(&config.resilience, RetryConfig::default_retriable())?;
        let connection_retry = RetryConfig::from_settings(
            &config.resilience,
            HashSet::from([ErrorKind::Connection]),
        )?;

        let llm_guard = self.llm_guard.unwrap_or_else(|| {
            DependencyGuard::from_settings(
                "llm",
                config.rate_limit.llm_calls_per_minute,
                &config.rate_limit,
                &config.resilience,
            )
        });
        let generator = SqlGenerator::new(client, llm_guard, &config.llm);

        let db_limiter = Arc::new(if config.rate_limit.enabled {
            RateLimiter::per_minute(
                "database",
                config.rate_limit.db_calls_per_minute,
                config.rate_limit.max_wait(),
            )
        } else {
            RateLimiter::unlimited("database")
        });
        let policy = Arc::new(config.security.clone());

        let mut order = Vec::with_capacity(self.pools.len());
        let mut executors = HashMap::with_capacity(self.pools.len());
        for pool in self.pools {
            let name = pool.name().to_string();
            if executors.contains_key(&name) {
                return Err(GatewayError::config(format!(
                    "Database names must be unique: '{}' appears more than once",
                    name
                )));
            }
            let guard = self.db_guard.clone().unwrap_or_else(|| {
                DependencyGuard::new(
                    db_limiter.clone(),
                    Arc::new(CircuitBreaker::new(
                        format!("database:{}", name),
                        config.resilience.circuit_breaker_threshold,
                        config.resilience.circuit_breaker_timeout(),
                    )),
                )
            });
            let executor = SqlExecutor::new(pool, policy.clone(), guard, connection_retry.clone());
            order.push(name.clone());
            executors.insert(name, executor);
        }

        let schema_cache = self
            .schema_cache
            .unwrap_or_else(|| SchemaCache::from_config(&config.cache));

        Ok(QueryOrchestrator {
            order,
            executors,
            generator,
            validator: SqlValidator::new(config.security),
            schema_cache,
            retry,
            max_question_length: config.validation.max_question_length,
        })
    }
}
