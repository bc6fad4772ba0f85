//! # Tandem Server
//!
//! Realtime collaborative document sync server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tandem
//!
//! # Override settings from the environment
//! TANDEM_PORT=8080 TANDEM_HOST=0.0.0.0 TANDEM_AUTH__ALLOW_ANONYMOUS=true tandem
//! ```

use anyhow::Result;
use tandem_server::{config, gateway, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "tandem=debug";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Tandem server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    gateway::run_server(config).await?;

    Ok(())
}
