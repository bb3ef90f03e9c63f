//! # Gateway Server
//!
//! Protocol-agnostic IoT gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! gateway
//!
//! # Run with a config file in the working directory
//! cp gateway.example.toml gateway.toml && gateway
//!
//! # Run with environment variables
//! GATEWAY_PORT=8080 GATEWAY_HOST=0.0.0.0 gateway
//! ```

mod config;
mod handlers;
mod metrics;
mod plugins;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=info,tenvis_gateway_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting gateway on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
