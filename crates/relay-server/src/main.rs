//! # ccrelay
//!
//! Relays clan chat from game clients to subscribed Discord channels.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (memory store, port 3000)
//! DISCORD_TOKEN=... APP_ID=... GUILD_ID=... ccrelay
//!
//! # Run with a config file in the working directory
//! ccrelay   # reads ./ccrelay.toml
//!
//! # Override settings with environment variables
//! PORT=8080 RELAY_STORAGE__BACKEND=sled ccrelay
//! ```

mod config;
mod discord;
mod handlers;
mod interactions;
mod metrics;
mod signature;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ccrelay=debug,ccrelay_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting ccrelay on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
