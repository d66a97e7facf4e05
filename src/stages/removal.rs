//! Reclaiming a database's backing object from a single stage.
//!
//! Only non-active tiers are reclaimable this way; the copy a record is
//! currently served from stays put.

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::{closest_stage, farthest_stage, is_valid_stage, path_for_stage, stage_kind, StageKind,
            StageRecord};
use crate::context::ServiceContext;
use crate::registry::RecordState;
use crate::vfs;

/// Remove the backing object for `record` from `stage`. The caller holds
/// the record lock and passes the guarded state down.
pub fn remove_from_stage(
    ctx: &ServiceContext,
    record: &dyn StageRecord,
    state: &RecordState,
    stage: u32,
) -> Result<()> {
    debug!(
        database = record.name(),
        stage, "Removing database from stage"
    );

    if !is_valid_stage(&ctx.stages, stage) {
        bail!(
            "invalid stage: {}. Valid stages are {}-{}",
            stage,
            closest_stage(&ctx.stages),
            farthest_stage(&ctx.stages)
        );
    }

    if stage == state.stage {
        bail!(
            "cannot remove database from its current active stage {}",
            stage
        );
    }

    match stage_kind(ctx, stage) {
        Some(StageKind::Memory) => {
            vfs::memory::delete(&format!("/{}", record.name()));
            debug!(
                database = record.name(),
                "Removed database from memory stage"
            );
            Ok(())
        }
        Some(StageKind::Local) => {
            let path = path_for_stage(ctx, record.name(), stage)?;
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(database = record.name(), path, "Removed database from local disk");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("failed to remove local file {}", path)),
            }
        }
        Some(StageKind::Remote) => {
            let key = format!("{}.db", record.name());
            ctx.store
                .delete(&key)
                .with_context(|| format!("failed to delete database object {}", key))?;
            debug!(database = record.name(), key, "Removed database from remote storage");
            Ok(())
        }
        None => bail!("invalid stage: {}", stage),
    }
}
