//! # Trellis Server
//!
//! Pub/sub broker with wildcard subscriptions and presence.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! trellis
//!
//! # Run with custom config
//! trellis --config /path/to/trellis.toml
//!
//! # Run with environment variables
//! TRELLIS_PORT=8080 TRELLIS_HOST=0.0.0.0 trellis
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn config_path() -> Result<Option<String>> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (None, _) => Ok(None),
        (Some("--config" | "-c"), Some(path)) => Ok(Some(path)),
        (Some(arg), _) => bail!("Unexpected argument {arg:?}, usage: trellis [--config <path>]"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis=debug,trellis_core=debug,trellis_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load(config_path()?.as_deref())?;

    tracing::info!("Starting Trellis server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
