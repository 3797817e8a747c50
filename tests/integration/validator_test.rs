//! Validator behavior under policies loaded from configuration files.

use std::io::Write;

use sqlgate::config::{Config, SecurityPolicy};
use sqlgate::error::{ErrorKind, GatewayError, ViolationKind};
use sqlgate::safety::SqlValidator;
use tempfile::NamedTempFile;

fn policy_from_toml(content: &str) -> SecurityPolicy {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    Config::load_from_file(file.path()).unwrap().security
}

fn violation_kind(err: &GatewayError) -> ViolationKind {
    err.as_violation().map(|v| v.kind).unwrap()
}

#[test]
fn test_policy_from_config_file() {
    let policy = policy_from_toml(
        r#"
[security]
blocked_tables = ["audit_log", "hr.salaries"]
blocked_columns = "users.password_hash, ssn"
allow_explain = true
"#,
    );
    let validator = SqlValidator::new(policy);

    validator
        .validate_or_raise("EXPLAIN SELECT id FROM users")
        .unwrap();

    let err = validator
        .validate_or_raise("SELECT * FROM AUDIT_LOG")
        .unwrap_err();
    assert_eq!(violation_kind(&err), ViolationKind::BlockedTable);

    let err = validator
        .validate_or_raise("SELECT amount FROM hr.salaries")
        .unwrap_err();
    assert_eq!(violation_kind(&err), ViolationKind::BlockedTable);

    let err = validator
        .validate_or_raise("SELECT u.password_hash FROM users u")
        .unwrap_err();
    assert_eq!(violation_kind(&err), ViolationKind::BlockedColumn);

    let err = validator
        .validate_or_raise("SELECT name FROM people WHERE ssn = '1'")
        .unwrap_err();
    assert_eq!(violation_kind(&err), ViolationKind::BlockedColumn);

    // Default blocked functions survive a file that does not mention them.
    let err = validator.validate_or_raise("SELECT pg_sleep(1)").unwrap_err();
    assert_eq!(violation_kind(&err), ViolationKind::BlockedFunction);
}

#[test]
fn test_realistic_analytics_queries_pass() {
    let validator = SqlValidator::new(SecurityPolicy::default());
    let queries = [
        "SELECT date_trunc('month', created_at) AS month, SUM(total) \
         FROM orders GROUP BY 1 ORDER BY 1",
        "SELECT id, RANK() OVER (PARTITION BY user_id ORDER BY total DESC) FROM orders",
        "WITH recent AS (SELECT * FROM orders WHERE created_at > now() - interval '7 days') \
         SELECT user_id, COUNT(*) FROM recent GROUP BY user_id HAVING COUNT(*) > 2",
        "SELECT email FROM users UNION SELECT email FROM newsletter_subscribers",
        "SELECT u.email, o.total FROM users u \
         LEFT JOIN orders o ON o.user_id = u.id WHERE o.total IS NOT NULL LIMIT 10",
        "SELECT CASE WHEN total > 100 THEN 'big' ELSE 'small' END AS bucket FROM orders",
        "select count(*) from users where lower(email) like '%@example.com'",
    ];

    for sql in queries {
        assert!(
            validator.validate_or_raise(sql).is_ok(),
            "expected to pass: {}",
            sql
        );
    }
}

#[test]
fn test_writes_and_ddl_rejected_under_any_policy() {
    let validator = SqlValidator::new(SecurityPolicy::default().with_blocked_functions(Vec::<String>::new()));
    let statements = [
        "INSERT INTO users (email) VALUES ('a@b.c')",
        "UPDATE users SET email = 'x'",
        "DELETE FROM orders",
        "DROP TABLE users",
        "TRUNCATE orders",
        "CREATE TABLE t (id int)",
        "ALTER TABLE users ADD COLUMN x int",
        "GRANT SELECT ON users TO public",
    ];

    for sql in statements {
        let err = validator.validate_or_raise(sql).unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::SecurityViolation,
            "expected a violation for: {}",
            sql
        );
        assert_eq!(violation_kind(&err), ViolationKind::StatementKind);
    }
}

#[test]
fn test_stacked_statements_rejected() {
    let validator = SqlValidator::new(SecurityPolicy::default());
    let err = validator
        .validate_or_raise("SELECT 1; SELECT 2")
        .unwrap_err();
    assert_eq!(violation_kind(&err), ViolationKind::MultipleStatements);

    let err = validator
        .validate_or_raise("SELECT * FROM users; DROP TABLE users")
        .unwrap_err();
    assert_eq!(violation_kind(&err), ViolationKind::MultipleStatements);
}

#[test]
fn test_garbage_is_a_parse_error() {
    let validator = SqlValidator::new(SecurityPolicy::default());
    for sql in ["", "   ", "SELEKT * FROM users", "SELECT * FROM"] {
        let err = validator.validate_or_raise(sql).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse, "expected a parse error for: {:?}", sql);
    }
}
