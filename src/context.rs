//! Process-wide service state: configuration, the registry, the stage
//! topology and the remote store client. Built once at startup and shared
//! behind an `Arc` by request handlers and background tasks.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::object_store::{ObjectStore, S3Client};
use crate::registry::Registry;
use crate::stages::{self, Stage};
use crate::vfs;

pub struct ServiceContext {
    pub config: Config,
    pub registry: Registry,
    pub stages: Vec<Stage>,
    pub store: Arc<dyn ObjectStore>,
}

impl ServiceContext {
    /// Assemble a context from parts. Used directly by tests; production
    /// startup goes through [`bootstrap`].
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Self {
        let stages = stages::setup_stages(&config);
        Self {
            config,
            registry: Registry::new(),
            stages,
            store,
        }
    }
}

/// Production startup: prepare the local scratch directory, connect to the
/// remote store (fatal if unreachable), register the storage backends and
/// seed the registry from the remote tier.
///
/// Performs blocking I/O; call from a blocking task.
pub fn bootstrap(config: Config) -> Result<Arc<ServiceContext>> {
    vfs::local::prepare_directory(&config.storage.local.directory_path)
        .context("Failed to prepare local storage directory")?;

    let store: Arc<dyn ObjectStore> = Arc::new(
        S3Client::connect(&config.storage.remote).context("Remote object store unreachable")?,
    );

    vfs::register_all(Arc::clone(&store))?;

    let ctx = Arc::new(ServiceContext::new(config, store));
    ctx.registry.seed_from_remote(&ctx)?;

    Ok(ctx)
}
