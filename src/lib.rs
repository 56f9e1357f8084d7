pub mod blocks;
pub mod canary;
pub mod config;
pub mod deploy;
pub mod dsl;
pub mod error;
pub mod fields;
pub mod outcome;
pub mod pack;
pub mod plan;
pub mod rollback;
pub mod schema;
pub mod server;
pub mod state;
pub mod telemetry;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the service in embedded mode using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).run().await
}
