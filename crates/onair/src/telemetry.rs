//! Logging setup for `onaird`.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use onairconf::TelemetryConfig;

const FALLBACK_FILTER: &str = "info,onair=debug";

/// Install the global subscriber: an `EnvFilter` built from the configured
/// level (which already folds in `RUST_LOG`) and a fmt layer.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|e| {
        eprintln!("invalid log level {:?} ({}), using {}", config.log_level, e, FALLBACK_FILTER);
        EnvFilter::new(FALLBACK_FILTER)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
