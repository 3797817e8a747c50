//! sqlgate - ask a PostgreSQL database questions in plain language.

use sqlgate::cli::Cli;
use sqlgate::config::Config;
use sqlgate::error::{GatewayError, Result};
use sqlgate::logging;
use sqlgate::query::QueryOrchestrator;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}: {}", e.category(), e);
            eprintln!("{}: {}", e.category(), e);
            std::process::exit(2);
        }
    }
}

/// Returns whether the query succeeded; the outcome is printed either way.
async fn run(cli: Cli) -> Result<bool> {
    let config_path = cli.config_path();
    let mut config = Config::load(&config_path)?;
    cli.apply_to(&mut config)?;
    logging::init_logging(&config.observability);
    info!("Loaded config from: {}", config_path.display());

    if cli.list_databases {
        for name in config.database_names() {
            println!("{}", name);
        }
        return Ok(true);
    }

    let orchestrator = QueryOrchestrator::connect(config).await?;
    let outcome = orchestrator.process(cli.to_request()).await;
    orchestrator.close().await;

    let json = serde_json::to_string_pretty(&outcome)
        .map_err(|e| GatewayError::internal(format!("Failed to serialize outcome: {}", e)))?;
    println!("{}", json);
    Ok(outcome.success)
}
