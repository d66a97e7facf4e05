//! Logging setup: a console layer for operators plus a file layer for
//! retention, both driven by the configured level.
//!
//! Initialization happens exactly once at startup; reinitialization within a
//! run is not supported.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level so operators can
/// raise verbosity per-target without touching service configuration.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.output_file_path)
        .with_context(|| {
            format!(
                "Failed to open log output file: {}",
                config.output_file_path
            )
        })?;

    let console_layer = tracing_subscriber::fmt::layer().with_target(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(Arc::new(log_file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    tracing::info!("Logging initialized");
    Ok(())
}
