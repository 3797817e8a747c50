//! Tests against a live PostgreSQL server.
//!
//! Skipped unless DATABASE_URL is set.

use std::sync::Arc;
use std::time::Duration;

use sqlgate::config::{Config, DatabaseConfig};
use sqlgate::db::{DatabasePool, FetchOptions, PostgresPool, Value};
use sqlgate::error::ErrorKind;
use sqlgate::llm::MockLlmClient;
use sqlgate::query::QueryOrchestrator;

/// Helper to get test database URL from environment.
fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

fn test_database_config() -> Option<DatabaseConfig> {
    let url = get_test_database_url()?;
    DatabaseConfig::from_connection_string("test", &url).ok()
}

async fn get_test_pool() -> Option<PostgresPool> {
    let config = test_database_config()?;
    PostgresPool::connect(&config).await.ok()
}

#[tokio::test]
async fn test_fetch_simple_select() {
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let rows = pool
        .fetch("SELECT 1 AS num, 'hello' AS greeting", &FetchOptions::default())
        .await
        .unwrap();

    assert_eq!(rows.columns.len(), 2);
    assert_eq!(rows.columns[0].name, "num");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0][0], Value::Int(1));
    assert_eq!(rows.rows[0][1], Value::from("hello"));

    pool.close().await;
}

#[tokio::test]
async fn test_numeric_values_keep_their_digits() {
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let rows = pool
        .fetch(
            "SELECT 99.99::numeric AS price, ARRAY[1.5, NULL]::numeric[] AS parts",
            &FetchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(rows.rows[0][0], Value::Decimal("99.99".to_string()));
    assert_eq!(
        rows.rows[0][1],
        Value::Array(vec![Value::Decimal("1.5".to_string()), Value::Null])
    );
    assert_eq!(rows.rows[0][0].to_json(), serde_json::json!(99.99));

    pool.close().await;
}

#[tokio::test]
async fn test_stacked_commands_are_refused_by_server() {
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let err = pool
        .fetch(
            "COMMIT; CREATE TABLE sqlgate_escaped (id int)",
            &FetchOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Database);

    let exists = pool
        .fetch(
            "SELECT to_regclass('sqlgate_escaped') IS NOT NULL AS present",
            &FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(exists.rows[0][0], Value::Bool(false));

    pool.close().await;
}

#[tokio::test]
async fn test_fetch_runs_read_only() {
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let err = pool
        .fetch(
            "CREATE TEMP TABLE sqlgate_should_fail (id int)",
            &FetchOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Database);

    pool.close().await;
}

#[tokio::test]
async fn test_statement_timeout_is_enforced() {
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let options = FetchOptions {
        statement_timeout: Some(Duration::from_millis(200)),
        ..FetchOptions::default()
    };
    let err = pool.fetch("SELECT pg_sleep(5)", &options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionTimeout);

    pool.close().await;
}

#[tokio::test]
async fn test_introspection_skips_system_schemas() {
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let schema = pool.introspect_schema().await.unwrap();
    assert_eq!(schema.database, "test");
    assert!(schema
        .tables
        .iter()
        .all(|t| t.schema != "pg_catalog" && t.schema != "information_schema"));

    pool.close().await;
}

#[tokio::test]
async fn test_orchestrator_against_live_database() {
    let Some(db_config) = test_database_config() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let Ok(pool) = PostgresPool::connect(&db_config).await else {
        eprintln!("Skipping test: database unreachable");
        return;
    };

    let client = Arc::new(MockLlmClient::new().then_respond("SELECT 41 + 1 AS answer"));
    let orchestrator = QueryOrchestrator::builder(Config::default())
        .with_pool(Arc::new(pool))
        .with_llm_client(client)
        .build()
        .unwrap();

    let outcome = orchestrator.process_query("what is the answer", None).await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.rows[0]["answer"], 42);

    orchestrator.close().await;
}
