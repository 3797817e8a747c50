//! End-to-end pipeline tests over mock dependencies.

use std::sync::Arc;
use std::time::Duration;

use sqlgate::config::Config;
use sqlgate::db::{Column, ColumnInfo, MockDatabasePool, RowSet, SchemaSnapshot, Table, Value};
use sqlgate::error::{ErrorKind, GatewayError};
use sqlgate::llm::MockLlmClient;
use sqlgate::query::{QueryOrchestrator, QueryRequest, ReturnMode};
use sqlgate::resilience::{CircuitBreaker, DependencyGuard, RateLimiter};

fn config() -> Config {
    let mut config = Config::default();
    config.resilience.max_attempts = 3;
    config.rate_limit.enabled = false;
    config
}

fn shop_schema() -> SchemaSnapshot {
    SchemaSnapshot::new("shop")
        .with_table(
            Table::new("public", "users")
                .with_column(Column::new("id", "integer").primary_key())
                .with_column(Column::new("email", "text"))
                .with_column(Column::new("password_hash", "text")),
        )
        .with_table(
            Table::new("public", "orders")
                .with_column(Column::new("id", "integer").primary_key())
                .with_column(Column::new("user_id", "integer")),
        )
}

fn count_rows(n: i64) -> RowSet {
    RowSet::new(vec![ColumnInfo::new("count", "INT8")], vec![vec![Value::Int(n)]])
}

fn shop_pool() -> Arc<MockDatabasePool> {
    Arc::new(
        MockDatabasePool::new("shop")
            .with_schema(shop_schema())
            .with_rows(count_rows(42)),
    )
}

fn orchestrator(pool: Arc<MockDatabasePool>, client: Arc<MockLlmClient>) -> QueryOrchestrator {
    QueryOrchestrator::builder(config())
        .with_pool(pool)
        .with_llm_client(client)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_question_is_answered() {
    let pool = shop_pool();
    let client = Arc::new(MockLlmClient::new());
    let orchestrator = orchestrator(pool.clone(), client.clone());

    let outcome = orchestrator.process_query("Count the users, please", None).await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.sql, "SELECT COUNT(*) FROM users");
    assert_eq!(outcome.database, "shop");
    assert_eq!(outcome.row_count, 1);
    assert_eq!(outcome.rows[0]["count"], 42);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(pool.executed_sql(), vec!["SELECT COUNT(*) FROM users"]);

    let system_prompt = &client.requests()[0][0].content;
    assert!(system_prompt.contains("password_hash"));
}

#[tokio::test]
async fn test_rejected_sql_is_regenerated_with_feedback() {
    let pool = shop_pool();
    let client = Arc::new(
        MockLlmClient::new()
            .then_respond("```sql\nDROP TABLE users;\n```")
            .then_respond("SELECT COUNT(*) FROM users"),
    );
    let orchestrator = orchestrator(pool.clone(), client.clone());

    let outcome = orchestrator.process_query("count users", None).await;

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(client.call_count(), 2);
    assert_eq!(pool.executed_sql(), vec!["SELECT COUNT(*) FROM users"]);

    let retry_prompt = client.last_user_prompt().unwrap();
    assert!(retry_prompt.contains("DROP TABLE users"));
    assert!(retry_prompt.contains("DROP"));
    assert!(retry_prompt.contains("Do not repeat the same SQL."));
}

#[tokio::test]
async fn test_database_error_is_fed_back() {
    let pool = Arc::new(
        MockDatabasePool::new("shop")
            .with_schema(shop_schema())
            .with_rows(count_rows(3))
            .with_fetch_failures([GatewayError::database("column \"emial\" does not exist")]),
    );
    let client = Arc::new(
        MockLlmClient::new()
            .then_respond("SELECT emial FROM users")
            .then_respond("SELECT email FROM users"),
    );
    let orchestrator = orchestrator(pool.clone(), client.clone());

    let outcome = orchestrator.process_query("list emails", None).await;

    assert!(outcome.success);
    assert_eq!(outcome.sql, "SELECT email FROM users");
    assert_eq!(outcome.attempts, 2);
    assert!(client
        .last_user_prompt()
        .unwrap()
        .contains("column \"emial\" does not exist"));
}

#[tokio::test]
async fn test_attempts_are_bounded() {
    let pool = shop_pool();
    let client = Arc::new(
        MockLlmClient::new()
            .then_respond("```sql\nDELETE FROM users\n```")
            .then_respond("```sql\nDELETE FROM users\n```")
            .then_respond("```\nDELETE FROM users;\n```")
            .then_respond("SELECT 1"),
    );
    let orchestrator = orchestrator(pool.clone(), client.clone());

    let outcome = orchestrator.process_query("remove everyone", None).await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.sql, "DELETE FROM users");
    assert_eq!(outcome.error_kind, Some(ErrorKind::SecurityViolation));
    assert_eq!(client.call_count(), 3);
    assert_eq!(pool.fetch_count(), 0);
}

#[tokio::test]
async fn test_unusable_reply_is_regenerated_with_feedback() {
    let pool = shop_pool();
    let client = Arc::new(
        MockLlmClient::new()
            .then_respond("I cannot answer that without more detail.")
            .then_respond("SELECT COUNT(*) FROM users"),
    );
    let orchestrator = orchestrator(pool.clone(), client.clone());

    let outcome = orchestrator.process_query("count users", None).await;

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 2);
    let retry_prompt = client.last_user_prompt().unwrap();
    assert!(retry_prompt.contains("YOUR PREVIOUS ATTEMPT FAILED"));
    assert!(retry_prompt.contains("Failed to extract SQL"));
}

#[tokio::test]
async fn test_unusable_replies_exhaust_attempts() {
    let client = Arc::new(MockLlmClient::new().with_response("weather", "It is sunny."));
    let orchestrator = orchestrator(shop_pool(), client.clone());

    let outcome = orchestrator.process_query("what is the weather", None).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Llm));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(client.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_is_retried_within_attempt_budget() {
    // The executor retries three times per attempt; the fourth fetch succeeds.
    let pool = Arc::new(
        MockDatabasePool::new("shop")
            .with_schema(shop_schema())
            .with_rows(count_rows(42))
            .with_fetch_failures((0..3).map(|_| GatewayError::connection("connection reset"))),
    );
    let client = Arc::new(MockLlmClient::new());
    let orchestrator = orchestrator(pool.clone(), client.clone());

    let outcome = orchestrator.process_query("count users", None).await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(pool.fetch_count(), 4);
    assert_eq!(outcome.rows[0]["count"], 42);
    // The database was at fault, so the model gets no SQL feedback.
    assert!(!client
        .last_user_prompt()
        .unwrap()
        .contains("YOUR PREVIOUS ATTEMPT FAILED"));
}

#[tokio::test(start_paused = true)]
async fn test_persistent_connection_loss_fails_after_budget() {
    let pool = Arc::new(
        MockDatabasePool::new("shop")
            .with_schema(shop_schema())
            .with_fetch_failures((0..9).map(|i| GatewayError::connection(format!("refused {i}")))),
    );
    let mut config = config();
    config.resilience.circuit_breaker_threshold = 100;
    let orchestrator = QueryOrchestrator::builder(config)
        .with_pool(pool.clone())
        .with_llm_client(Arc::new(MockLlmClient::new()))
        .build()
        .unwrap();

    let outcome = orchestrator.process_query("count users", None).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Connection));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(pool.fetch_count(), 9);
}

#[tokio::test]
async fn test_blocked_column_never_reaches_database() {
    let pool = shop_pool();
    let client = Arc::new(MockLlmClient::new().with_response("hash", "SELECT password_hash FROM users"));
    let mut config = config();
    config.security = config.security.with_blocked_columns(["users.password_hash"]);
    let orchestrator = QueryOrchestrator::builder(config)
        .with_pool(pool.clone())
        .with_llm_client(client.clone())
        .build()
        .unwrap();

    let outcome = orchestrator.process_query("show password hash", None).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::SecurityViolation));
    assert!(outcome.error.unwrap().contains("password_hash"));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(client.call_count(), 3);
    assert_eq!(pool.fetch_count(), 0);
}

#[tokio::test]
async fn test_sql_mode_skips_execution() {
    let pool = shop_pool();
    let orchestrator = orchestrator(pool.clone(), Arc::new(MockLlmClient::new()));

    let outcome = orchestrator
        .process(QueryRequest::new("count orders").with_return_mode(ReturnMode::Sql))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.sql, "SELECT COUNT(*) FROM orders");
    assert!(outcome.rows.is_empty());
    assert_eq!(pool.fetch_count(), 0);
}

#[tokio::test]
async fn test_request_row_cap() {
    let pool = Arc::new(
        MockDatabasePool::new("shop")
            .with_schema(shop_schema())
            .with_rows(RowSet::new(
                vec![ColumnInfo::new("id", "INT4")],
                (0..250).map(|i| vec![Value::Int(i)]).collect(),
            )),
    );
    let orchestrator = orchestrator(pool, Arc::new(MockLlmClient::new()));

    let outcome = orchestrator
        .process(QueryRequest::new("list users").with_max_rows(100))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.row_count, 100);
    assert_eq!(outcome.total_row_count, 250);
}

#[tokio::test]
async fn test_database_selection() {
    let other = Arc::new(
        MockDatabasePool::new("analytics")
            .with_schema(shop_schema())
            .with_rows(count_rows(7)),
    );
    let orchestrator = QueryOrchestrator::builder(config())
        .with_pool(shop_pool())
        .with_pool(other.clone())
        .with_llm_client(Arc::new(MockLlmClient::new()))
        .build()
        .unwrap();

    assert_eq!(orchestrator.available_databases(), vec!["shop", "analytics"]);

    let outcome = orchestrator
        .process_query("count users", Some("analytics"))
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.database, "analytics");
    assert_eq!(other.fetch_count(), 1);

    let outcome = orchestrator.process_query("count users", Some("nope")).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::NoDatabaseFound));
    let message = outcome.error.unwrap();
    assert!(message.contains("shop"));
    assert!(message.contains("analytics"));
}

#[tokio::test]
async fn test_question_is_checked_first() {
    let client = Arc::new(MockLlmClient::new());
    let orchestrator = orchestrator(shop_pool(), client.clone());

    let outcome = orchestrator.process_query("   ", None).await;
    assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidInput));
    assert_eq!(outcome.attempts, 0);

    let too_long = "x".repeat(10_001);
    let outcome = orchestrator.process_query(&too_long, None).await;
    assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidInput));

    assert_eq!(client.call_count(), 0);
}

#[tokio::test]
async fn test_schema_is_cached_between_questions() {
    let pool = shop_pool();
    let orchestrator = orchestrator(pool.clone(), Arc::new(MockLlmClient::new()));

    orchestrator.process_query("count users", None).await;
    orchestrator.process_query("list users", None).await;

    assert_eq!(pool.introspect_count(), 1);
    assert!(orchestrator.schema_cache().get_fresh("shop").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_model_failures_back_off_and_recover() {
    let client = Arc::new(
        MockLlmClient::new()
            .then_fail(GatewayError::llm("upstream 502"))
            .then_respond("SELECT COUNT(*) FROM users"),
    );
    let orchestrator = orchestrator(shop_pool(), client.clone());

    let outcome = orchestrator.process_query("count users", None).await;

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 2);
    // Transport failures are not fed back as SQL errors.
    assert!(!client
        .last_user_prompt()
        .unwrap()
        .contains("YOUR PREVIOUS ATTEMPT FAILED"));
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_stops_immediately() {
    let breaker = Arc::new(CircuitBreaker::new("llm", 1, Duration::from_secs(60)));
    let guard = DependencyGuard::new(Arc::new(RateLimiter::unlimited("llm")), breaker);
    let client = Arc::new(MockLlmClient::new().then_fail(GatewayError::llm("down")));
    let orchestrator = QueryOrchestrator::builder(config())
        .with_pool(shop_pool())
        .with_llm_client(client.clone())
        .with_llm_guard(guard)
        .build()
        .unwrap();

    let outcome = orchestrator.process_query("count users", None).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::CircuitOpen));
    assert_eq!(outcome.attempts, 2);
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn test_close_closes_pools() {
    let pool = shop_pool();
    let orchestrator = orchestrator(pool.clone(), Arc::new(MockLlmClient::new()));
    orchestrator.close().await;
    assert!(pool.is_closed());
}
