//! Stage topology and the placement controller.
//!
//! Stages are totally ordered by index: lower is closer to the client
//! (faster, more volatile), higher is farther (slower, more durable). The
//! controller moves databases between stages, keeps upper tiers in sync and
//! verifies copies after promotion. It reaches records only through the
//! [`StageRecord`] capability, never through a concrete type, so tests can
//! substitute doubles.

pub mod copy;
pub mod monitor;
pub mod removal;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::context::ServiceContext;
use crate::registry::RecordState;

pub use removal::remove_from_stage;

/// Backend family of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Memory,
    Local,
    Remote,
}

/// One storage tier.
#[derive(Debug, Clone)]
pub struct Stage {
    pub index: u32,
    pub name: String,
    pub kind: StageKind,
}

/// Abstract record capability: a name plus the locked placement state. The
/// controller takes the writer side for transitions and the reader side for
/// snapshots.
pub trait StageRecord: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> &RwLock<RecordState>;
}

/// Build the stage table from configuration, ordered closest first.
pub fn setup_stages(config: &crate::config::Config) -> Vec<Stage> {
    let mut stages = vec![
        Stage {
            index: config.storage.memory.stage_number,
            name: config.storage.memory.name.clone(),
            kind: StageKind::Memory,
        },
        Stage {
            index: config.storage.local.stage_number,
            name: config.storage.local.name.clone(),
            kind: StageKind::Local,
        },
        Stage {
            index: config.storage.remote.stage_number,
            name: config.storage.remote.name.clone(),
            kind: StageKind::Remote,
        },
    ];
    stages.sort_by_key(|s| s.index);
    stages
}

pub fn is_valid_stage(stages: &[Stage], index: u32) -> bool {
    stages.iter().any(|s| s.index == index)
}

pub fn closest_stage(stages: &[Stage]) -> u32 {
    stages.first().map(|s| s.index).unwrap_or(0)
}

pub fn farthest_stage(stages: &[Stage]) -> u32 {
    stages.last().map(|s| s.index).unwrap_or(0)
}

pub fn next_closer_stage(stages: &[Stage], index: u32) -> Option<u32> {
    stages
        .iter()
        .rev()
        .map(|s| s.index)
        .find(|&i| i < index)
}

pub fn next_farther_stage(stages: &[Stage], index: u32) -> Option<u32> {
    stages.iter().map(|s| s.index).find(|&i| i > index)
}

pub fn stage_name(stages: &[Stage], index: u32) -> &str {
    stages
        .iter()
        .find(|s| s.index == index)
        .map(|s| s.name.as_str())
        .unwrap_or("Unknown")
}

pub fn stage_kind(ctx: &ServiceContext, index: u32) -> Option<StageKind> {
    ctx.stages
        .iter()
        .find(|s| s.index == index)
        .map(|s| s.kind)
}

/// Backing path for `name` at `stage`, per the stage conventions: memory
/// keys carry a leading slash, local paths live in the configured
/// directory, remote keys are the bare name.
pub fn path_for_stage(ctx: &ServiceContext, name: &str, stage: u32) -> Result<String> {
    match stage_kind(ctx, stage) {
        Some(StageKind::Memory) => Ok(format!("/{}", name)),
        Some(StageKind::Local) => Ok(format!(
            "{}/{}.db",
            ctx.config.storage.local.directory_path, name
        )),
        Some(StageKind::Remote) => Ok(name.to_string()),
        None => bail!("invalid stage: {}", stage),
    }
}

/// Connection URI for `name` at `stage`.
pub fn connection_uri_for_stage(ctx: &ServiceContext, name: &str, stage: u32) -> Result<String> {
    match stage_kind(ctx, stage) {
        Some(StageKind::Memory) => Ok(format!("file:/{}?vfs=memory", name)),
        Some(StageKind::Local) => {
            let path = path_for_stage(ctx, name, stage)?;
            Ok(format!("file:{}?vfs=disk", path))
        }
        Some(StageKind::Remote) => {
            let key = if name.ends_with(".db") {
                name.to_string()
            } else {
                format!("{}.db", name)
            };
            Ok(format!("file:{}?vfs=r2", key))
        }
        None => bail!("invalid stage: {}", stage),
    }
}

/// Move a database to `target`, copying live contents first. On success the
/// record's stage and path are rewritten; on failure they are untouched.
/// Promotions run an integrity check on the copy; a failed check is logged
/// but does not roll the move back.
pub fn move_to_stage(ctx: &ServiceContext, record: &dyn StageRecord, target: u32) -> Result<()> {
    let mut state = record.state().write();
    move_to_stage_locked(ctx, record, &mut state, target)
}

pub(crate) fn move_to_stage_locked(
    ctx: &ServiceContext,
    record: &dyn StageRecord,
    state: &mut RecordState,
    target: u32,
) -> Result<()> {
    debug!(
        database = record.name(),
        current_stage = state.stage,
        target_stage = target,
        "Moving database to different stage"
    );

    if !is_valid_stage(&ctx.stages, target) {
        error!(target_stage = target, "Invalid target stage");
        bail!(
            "invalid stage: {}. Valid stages are {}-{}",
            target,
            closest_stage(&ctx.stages),
            farthest_stage(&ctx.stages)
        );
    }

    if state.stage == target {
        warn!(
            database = record.name(),
            target_stage = target,
            "Database already at target stage"
        );
        return Ok(());
    }

    let original_stage = state.stage;

    sync_to_stage(ctx, record.name(), state, target)
        .with_context(|| format!("failed to sync database to stage {}", target))?;

    state.stage = target;
    state.path = path_for_stage(ctx, record.name(), target)?;
    state.request_count = 0;

    if target < original_stage {
        let uri = connection_uri_for_stage(ctx, record.name(), target)?;
        if let Err(e) = verify_database_integrity(&uri) {
            warn!(
                database = record.name(),
                stage = target,
                error = %e,
                "Database integrity check failed after promotion"
            );
        }
    }

    Ok(())
}

/// Copy the database from its current stage to `target` without changing
/// the record. Both endpoints are probed before the copy starts.
fn sync_to_stage(
    ctx: &ServiceContext,
    name: &str,
    state: &RecordState,
    target: u32,
) -> Result<()> {
    let source_uri = connection_uri_for_stage(ctx, name, state.stage)?;
    let source = Connection::open(&source_uri)
        .with_context(|| format!("failed to open source database {}", source_uri))?;
    ping(&source).context("source database ping failed")?;
    drop(source);

    let target_uri = connection_uri_for_stage(ctx, name, target)?;
    let target_conn = Connection::open(&target_uri)
        .with_context(|| format!("failed to open target database {}", target_uri))?;
    ping(&target_conn).context("target database ping failed")?;
    drop(target_conn);

    copy::copy_data_between_stages(ctx, name, state.stage, target)
        .context("failed to copy database data")
}

/// Promote one stage closer to the client. Runs under the record write lock
/// as a background task; failures are logged.
pub fn promote_to_closer_stage(ctx: &ServiceContext, record: &dyn StageRecord) {
    let mut state = record.state().write();

    if state.stage == closest_stage(&ctx.stages) {
        warn!(
            database = record.name(),
            "Database already at closest stage, no promotion needed"
        );
        return;
    }

    let Some(target) = next_closer_stage(&ctx.stages, state.stage) else {
        warn!(
            database = record.name(),
            "Cannot promote database further"
        );
        return;
    };

    debug!(
        database = record.name(),
        current_stage = state.stage,
        target_stage = target,
        request_count = state.request_count,
        "Promoting database to closer stage"
    );

    state.request_count = 0;

    // Probe the source before committing to the move.
    let source_uri = match connection_uri_for_stage(ctx, record.name(), state.stage) {
        Ok(uri) => uri,
        Err(e) => {
            error!(database = record.name(), error = %e, "Failed to resolve source for promotion");
            return;
        }
    };
    let probe = Connection::open(&source_uri).and_then(|conn| {
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    });
    if let Err(e) = probe {
        error!(
            database = record.name(),
            error = %e,
            "Source database not accessible for promotion"
        );
        return;
    }

    match move_to_stage_locked(ctx, record, &mut state, target) {
        Ok(()) => info!(
            database = record.name(),
            target_stage = target,
            "Successfully promoted database to closer stage"
        ),
        Err(e) => error!(
            database = record.name(),
            target_stage = target,
            error = %e,
            "Failed to auto-promote database to closer stage"
        ),
    }
}

/// Demote one stage farther from the client after sustained inactivity.
/// Inactivity is re-checked under the record lock so a request racing the
/// monitor wins.
pub fn demote_to_farther_stage(ctx: &ServiceContext, record: &dyn StageRecord) {
    let mut state = record.state().write();

    if state.stage == farthest_stage(&ctx.stages) {
        warn!(
            database = record.name(),
            "Database already at farthest stage, no demotion needed"
        );
        return;
    }

    let time_since_access = state.last_accessed.elapsed();
    let timeout = Duration::from_secs(ctx.config.settings.stage_timeout_secs);
    if time_since_access < timeout {
        debug!(
            database = record.name(),
            ?time_since_access,
            "Database not ready for demotion due to recent access"
        );
        return;
    }

    let Some(target) = next_farther_stage(&ctx.stages, state.stage) else {
        warn!(database = record.name(), "Cannot demote database further");
        return;
    };

    info!(
        database = record.name(),
        current_stage = state.stage,
        target_stage = target,
        ?time_since_access,
        "Auto-demoting database due to inactivity"
    );

    if ctx.config.settings.auto_sync_enabled {
        debug!(
            database = record.name(),
            "Syncing database to upper stages before demotion"
        );
        let mut stage = next_farther_stage(&ctx.stages, state.stage);
        while let Some(upper) = stage {
            match sync_to_stage(ctx, record.name(), &state, upper) {
                Err(e) => {
                    // Demotion proceeds even when a pre-sync fails; the
                    // failure is visible in the logs.
                    error!(
                        database = record.name(),
                        stage = upper,
                        error = %e,
                        "Failed to sync database to upper stage before demotion"
                    );
                }
                Ok(()) => match verify_database_at_stage(ctx, record.name(), upper) {
                    Ok(()) => debug!(
                        database = record.name(),
                        stage = upper,
                        "Database verified at upper stage"
                    ),
                    Err(e) => warn!(
                        database = record.name(),
                        stage = upper,
                        error = %e,
                        "Database verification failed after sync to upper stage"
                    ),
                },
            }
            stage = next_farther_stage(&ctx.stages, upper);
        }
    }

    state.request_count = 0;

    if let Err(e) = move_to_stage_locked(ctx, record, &mut state, target) {
        error!(
            database = record.name(),
            target_stage = target,
            error = %e,
            "Failed to auto-demote database to farther stage"
        );
    }
}

/// Write-through: copy the database to every stage strictly above its
/// current one, up to and including the persistence stage. Stops on the
/// first failure.
pub fn sync_to_upper_stages(ctx: &ServiceContext, record: &dyn StageRecord) {
    if !ctx.config.settings.auto_sync_enabled {
        return;
    }

    // The write lock prevents concurrent sync operations on one database.
    let state = record.state().write();

    debug!(
        database = record.name(),
        current_stage = state.stage,
        "Syncing database to upper stages"
    );

    let persistence = ctx.config.settings.persistence_stage;
    let mut stage = next_farther_stage(&ctx.stages, state.stage);
    while let Some(upper) = stage {
        if upper > persistence {
            break;
        }
        if let Err(e) = sync_to_stage(ctx, record.name(), &state, upper) {
            error!(
                database = record.name(),
                stage = upper,
                error = %e,
                "Failed to sync database to upper stage"
            );
            break;
        }
        stage = next_farther_stage(&ctx.stages, upper);
    }

    debug!(database = record.name(), "Sync to upper stages completed");
}

fn ping(connection: &Connection) -> Result<()> {
    connection.query_row("SELECT 1", [], |_| Ok(()))?;
    Ok(())
}

/// Full integrity check: reachable, catalog readable, and
/// `PRAGMA integrity_check` reports ok.
pub fn verify_database_integrity(uri: &str) -> Result<()> {
    let connection = Connection::open(uri)
        .with_context(|| format!("failed to open database for integrity check: {}", uri))?;
    ping(&connection).context("database ping failed during integrity check")?;

    connection
        .prepare("SELECT name FROM sqlite_master WHERE type='table'")?
        .query([])
        .context("failed to query sqlite_master")?;

    let result: String = connection
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .context("failed to run integrity check")?;

    if result != "ok" {
        bail!("database integrity check failed: {}", result);
    }

    info!(uri, "Database integrity check passed");
    Ok(())
}

/// Cheap post-copy verification: the destination must hold at least one
/// user table, otherwise the copy silently lost data.
fn verify_database_at_stage(ctx: &ServiceContext, name: &str, stage: u32) -> Result<()> {
    let uri = connection_uri_for_stage(ctx, name, stage)?;
    let connection = Connection::open(&uri)
        .with_context(|| format!("failed to open database at stage {}", stage))?;
    ping(&connection).with_context(|| format!("failed to ping database at stage {}", stage))?;

    let table_count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;

    if table_count == 0 {
        bail!(
            "database at stage {} exists but has no tables (possible data loss)",
            stage
        );
    }

    debug!(stage, table_count, "Database verification successful");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn stages_from_default_config() -> Vec<Stage> {
        setup_stages(&Config::default())
    }

    #[test]
    fn test_stage_ordering_helpers() {
        let stages = stages_from_default_config();

        assert_eq!(closest_stage(&stages), 1);
        assert_eq!(farthest_stage(&stages), 3);

        assert_eq!(next_closer_stage(&stages, 3), Some(2));
        assert_eq!(next_closer_stage(&stages, 2), Some(1));
        assert_eq!(next_closer_stage(&stages, 1), None);

        assert_eq!(next_farther_stage(&stages, 1), Some(2));
        assert_eq!(next_farther_stage(&stages, 2), Some(3));
        assert_eq!(next_farther_stage(&stages, 3), None);

        assert!(is_valid_stage(&stages, 2));
        assert!(!is_valid_stage(&stages, 0));
        assert!(!is_valid_stage(&stages, 4));
    }

    #[test]
    fn test_stage_names() {
        let stages = stages_from_default_config();
        assert_eq!(stage_name(&stages, 1), "Memory Storage");
        assert_eq!(stage_name(&stages, 3), "Remote Storage");
        assert_eq!(stage_name(&stages, 9), "Unknown");
    }
}
