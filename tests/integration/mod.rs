//! Integration tests for sqlgate.

pub mod orchestrator_test;
pub mod postgres_test;
pub mod validator_test;
