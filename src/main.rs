//! Main entry point for the Persisto service.
//! Slim bootstrap that wires configuration, storage backends, the registry
//! and the HTTP listener together.

use anyhow::Result;
use persisto::config::Config;
use persisto::{context, observability, server, stages};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    observability::init_logging(&config.logging)?;

    tracing::info!("Starting Persisto");

    // Startup does blocking I/O (directory prep, remote probe, registry
    // seeding), so it runs off the async worker threads.
    let ctx = tokio::task::spawn_blocking(move || context::bootstrap(config)).await??;

    stages::monitor::spawn_stage_monitor(Arc::clone(&ctx));

    server::serve(ctx).await
}
