//! Inactivity monitor: a single background task that periodically sweeps
//! the registry and schedules demotions for idle databases.
//!
//! The sweep itself does no blocking I/O; each demotion runs as its own
//! blocking task and re-checks inactivity under the record lock, so a
//! request racing the monitor wins.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{demote_to_farther_stage, farthest_stage};
use crate::context::ServiceContext;

/// Start the monitor. No-op when automatic stage movement is disabled.
pub fn spawn_stage_monitor(ctx: Arc<ServiceContext>) {
    if !ctx.config.settings.auto_stage_movement {
        info!("Auto stage movement disabled, not starting stage monitor");
        return;
    }

    let timeout_secs = ctx.config.settings.stage_timeout_secs;
    let period = Duration::from_secs((timeout_secs / 2).max(1));

    tokio::spawn(async move {
        info!(
            timeout_secs,
            period_secs = period.as_secs(),
            "Starting stage monitor"
        );

        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; skip it so a fresh start does
        // not sweep before anything could possibly be idle.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep(&ctx);
        }
    });
}

/// One monitor pass: snapshot the registry and schedule demotions for every
/// record idle past the timeout and not already at the farthest stage.
pub fn sweep(ctx: &Arc<ServiceContext>) {
    let databases = ctx.registry.snapshot();
    debug!(count = databases.len(), "Checking databases for inactivity");

    let farthest = farthest_stage(&ctx.stages);
    let timeout = Duration::from_secs(ctx.config.settings.stage_timeout_secs);

    for database in databases {
        let (stage, idle) = {
            let state = database.state().read();
            (state.stage, state.last_accessed.elapsed())
        };

        if stage >= farthest {
            continue;
        }

        if idle >= timeout {
            debug!(
                database = database.name(),
                stage,
                idle_secs = idle.as_secs(),
                "Database inactive, scheduling demotion"
            );

            let ctx = Arc::clone(ctx);
            tokio::task::spawn_blocking(move || {
                demote_to_farther_stage(&ctx, database.as_ref());
            });
        }
    }
}
