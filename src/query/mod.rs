//! Query pipeline for sqlgate.
//!
//! Generation, execution and the orchestrator that ties them to the
//! validator, schema cache and retry budget.

pub mod executor;
pub mod generator;
pub mod orchestrator;

pub use executor::{ExecutionOutcome, SqlExecutor};
pub use generator::SqlGenerator;
pub use orchestrator::{OrchestratorBuilder, QueryOrchestrator, QueryOutcome, QueryRequest, ReturnMode};
