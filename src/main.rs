use anyhow::{Context, Result};
use release_news::{Config, HealthState, LogFormat, init_logging, run_with_ctrl_c};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    init_logging(LogFormat::from_env())?;

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(event = "startup", role = ?config.role, "Release news service starting");

    let health_state = Arc::new(RwLock::new(HealthState::for_role(config.role)));
    run_with_ctrl_c(config, health_state).await
}
