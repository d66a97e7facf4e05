//! Database registry: name → placement record, plus record lifecycle.
//!
//! Records are created here, their counters and timestamps are stamped by
//! the executor, and their stage/path are rewritten only by the stage
//! manager. Registry mutations are serialized by the API layer; per-record
//! mutations take the record's own lock.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::context::ServiceContext;
use crate::stages::{self, StageKind, StageRecord};
use crate::vfs::remote;

pub const MAX_NAME_LENGTH: usize = 128;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database not found")]
    NotFound,

    #[error("a database with this name already exists")]
    Conflict,

    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Mutable placement and accounting fields of a record, guarded by the
/// record's reader-writer lock.
#[derive(Debug)]
pub struct RecordState {
    pub stage: u32,
    pub path: String,
    /// Monotonic timestamp driving the inactivity policy.
    pub last_accessed: Instant,
    /// Wall-clock counterpart reported through the API.
    pub last_accessed_at: DateTime<Utc>,
    /// Requests since the last stage transition.
    pub request_count: u32,
}

/// One managed database.
#[derive(Debug)]
pub struct Database {
    name: String,
    state: RwLock<RecordState>,
}

impl Database {
    pub fn new(name: impl Into<String>, stage: u32, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(RecordState {
                stage,
                path: path.into(),
                last_accessed: Instant::now(),
                last_accessed_at: Utc::now(),
                request_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &RwLock<RecordState> {
        &self.state
    }

    /// Stamp the access timestamp and bump the request counter.
    pub fn handle_access(&self) {
        let mut state = self.state.write();
        let previous = state.request_count;
        state.last_accessed = Instant::now();
        state.last_accessed_at = Utc::now();
        state.request_count += 1;

        debug!(
            database = %self.name,
            previous_count = previous,
            current_count = state.request_count,
            "Handling database access"
        );
    }

    /// Connection URI for the record's current stage.
    pub fn connection_uri(&self, ctx: &ServiceContext) -> Result<String> {
        let state = self.state.read();
        stages::connection_uri_for_stage(ctx, &self.name, state.stage)
    }
}

impl StageRecord for Database {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &RwLock<RecordState> {
        &self.state
    }
}

/// All known databases. Lookup is a linear scan; the registry holds tens of
/// records, not millions.
#[derive(Default)]
pub struct Registry {
    items: RwLock<Vec<Arc<Database>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Arc<Database>> {
        self.items.read().clone()
    }

    pub fn find_by_name(&self, name: &str) -> Result<Arc<Database>, RegistryError> {
        self.items
            .read()
            .iter()
            .find(|db| db.name() == name)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    /// Create a record at `stage`, initialize the backing object, and append
    /// it to the registry.
    pub fn create(
        &self,
        ctx: &ServiceContext,
        name: &str,
        stage: u32,
    ) -> Result<Arc<Database>, RegistryError> {
        validate_name(name)?;

        let path = stages::path_for_stage(ctx, name, stage)
            .map_err(|e| RegistryError::InvalidArgument(e.to_string()))?;

        if self.find_by_name(name).is_ok() {
            return Err(RegistryError::Conflict);
        }

        let database = Arc::new(Database::new(name, stage, path));
        initialize_database(ctx, &database)?;

        let mut items = self.items.write();
        if items.iter().any(|db| db.name() == name) {
            return Err(RegistryError::Conflict);
        }
        items.push(Arc::clone(&database));

        info!(database = name, stage, "Database created");
        Ok(database)
    }

    /// Tear down the backing objects in every tier from the persistence
    /// stage down to the record's current stage, then unlink the record.
    /// Individual stage removals are best-effort.
    pub fn delete(&self, ctx: &ServiceContext, database: &Arc<Database>) -> Result<()> {
        info!(database = %database.name(), "Starting database deletion");

        {
            let state = database.state().write();
            let persistence = ctx.config.settings.persistence_stage;

            // Descending sweep; the range form cannot wrap below the
            // record's current stage.
            for stage in (state.stage..=persistence).rev() {
                match stages::remove_from_stage(ctx, database.as_ref(), &state, stage) {
                    Ok(()) => {
                        info!(database = %database.name(), stage, "Removed database from stage")
                    }
                    Err(e) => {
                        error!(
                            database = %database.name(),
                            stage,
                            error = %e,
                            "Failed to remove database from stage"
                        )
                    }
                }
            }
        }

        let mut items = self.items.write();
        let before = items.len();
        items.retain(|db| db.name() != database.name());
        if items.len() == before {
            warn!(database = %database.name(), "Database missing from registry during deletion");
        }

        info!(database = %database.name(), "Database deletion completed");
        Ok(())
    }

    /// Seed the registry from the remote tier's listing. Runs once at
    /// startup so databases survive service restarts.
    pub fn seed_from_remote(&self, ctx: &ServiceContext) -> Result<()> {
        let remote_stage = ctx.config.storage.remote.stage_number;
        let discovered = remote::list_databases(ctx.store.as_ref())
            .context("Failed to list databases in remote storage")?;

        let mut items = self.items.write();
        for db in &discovered {
            if items.iter().any(|existing| existing.name() == db.name) {
                continue;
            }
            items.push(Arc::new(Database::new(
                db.name.clone(),
                remote_stage,
                db.key.clone(),
            )));
        }

        info!(count = discovered.len(), "Seeded registry from remote storage");
        Ok(())
    }
}

/// Names address files in three backends, so they must be short and free of
/// path separators.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::InvalidArgument(
            "database name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(RegistryError::InvalidArgument(format!(
            "database name must be at most {} characters",
            MAX_NAME_LENGTH
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(RegistryError::InvalidArgument(
            "database name must not contain path separators".to_string(),
        ));
    }
    Ok(())
}

/// Open a connection at the record's stage and force the file into
/// existence. Object stores do not materialize a key until the first write,
/// so the remote tier needs one schema operation before the database is
/// visible.
fn initialize_database(ctx: &ServiceContext, database: &Arc<Database>) -> Result<(), RegistryError> {
    let uri = database
        .connection_uri(ctx)
        .map_err(RegistryError::Internal)?;

    let connection = Connection::open(&uri)
        .with_context(|| format!("Failed to open connection {}", uri))
        .map_err(RegistryError::Internal)?;

    let stage = database.state().read().stage;
    let is_remote = stages::stage_kind(ctx, stage) == Some(StageKind::Remote);

    if is_remote {
        debug!(database = %database.name(), "Materializing database object in remote storage");
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS _persisto_init (id INTEGER PRIMARY KEY)",
                [],
            )
            .context("Failed to create init table in remote storage")
            .map_err(RegistryError::Internal)?;
        connection
            .execute("DROP TABLE IF EXISTS _persisto_init", [])
            .context("Failed to clean up init table in remote storage")
            .map_err(RegistryError::Internal)?;
    } else {
        connection
            .query_row("SELECT 1", [], |_| Ok(()))
            .context("Database probe query failed")
            .map_err(RegistryError::Internal)?;
    }

    info!(database = %database.name(), stage, "Database initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("users").is_ok());
        assert!(validate_name(&"a".repeat(MAX_NAME_LENGTH)).is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LENGTH + 1)).is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
    }

    #[test]
    fn test_handle_access_stamps_counters() {
        let db = Database::new("counters", 3, "counters");
        assert_eq!(db.state().read().request_count, 0);

        db.handle_access();
        db.handle_access();

        let state = db.state().read();
        assert_eq!(state.request_count, 2);
        assert!(state.last_accessed.elapsed().as_secs() < 5);
    }

    #[test]
    fn test_find_by_name_missing() {
        let registry = Registry::new();
        assert!(matches!(
            registry.find_by_name("ghost"),
            Err(RegistryError::NotFound)
        ));
    }
}
