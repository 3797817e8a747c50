//! sqlgate - a natural-language to SQL query gateway.
//!
//! Questions are turned into SQL by a language model, checked against a
//! security policy at the AST level, and run read-only against a pooled
//! PostgreSQL connection, under retry, rate-limiting and circuit-breaking.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod logging;
pub mod query;
pub mod resilience;
pub mod safety;
