//! Cross-tier copy of a live database.
//!
//! Three strategies, picked by the endpoints: engine-native `VACUUM INTO`
//! when source and destination share a backend, a scratch-file hop out of
//! the memory tier, and schema-plus-rows replication inside one destination
//! transaction when the copy crosses backends (the engine's native backup
//! cannot write through a different VFS than its connection).

use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params_from_iter, types::Value, Connection};
use tracing::{debug, warn};

use super::{connection_uri_for_stage, path_for_stage, stage_kind, StageKind};
use crate::context::ServiceContext;
use crate::utils::{retry_blocking, COPY_BACKOFF_MS, COPY_MAX_RETRIES};
use crate::vfs;

/// Copy the contents of `name` from `source_stage` to `target_stage`.
pub fn copy_data_between_stages(
    ctx: &ServiceContext,
    name: &str,
    source_stage: u32,
    target_stage: u32,
) -> Result<()> {
    let source_uri = connection_uri_for_stage(ctx, name, source_stage)?;
    let source = Connection::open(&source_uri)
        .with_context(|| format!("failed to open source database {}", source_uri))?;

    if stage_kind(ctx, source_stage) == Some(StageKind::Memory) {
        return copy_from_memory_stage(ctx, &source, name, target_stage);
    }

    if source_stage != target_stage {
        let target_uri = connection_uri_for_stage(ctx, name, target_stage)?;
        return copy_across_vfs(&source, &target_uri);
    }

    vacuum_into(ctx, &source, name, target_stage)?;

    debug!(
        database = name,
        source_stage, target_stage, "Copied data between stages"
    );
    Ok(())
}

/// Engine-native backup into the destination path, retried briefly because
/// a just-deleted target may still be settling.
fn vacuum_into(
    ctx: &ServiceContext,
    source: &Connection,
    name: &str,
    target_stage: u32,
) -> Result<()> {
    best_effort_delete_target(ctx, name, target_stage);

    let target_path = path_for_stage(ctx, name, target_stage)?;
    retry_blocking(COPY_MAX_RETRIES, Duration::from_millis(COPY_BACKOFF_MS), || {
        source
            .execute("VACUUM INTO ?1", [&target_path])
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("failed to vacuum database to target: {}", e))
    })
}

fn best_effort_delete_target(ctx: &ServiceContext, name: &str, target_stage: u32) {
    match stage_kind(ctx, target_stage) {
        Some(StageKind::Memory) => vfs::memory::delete(&format!("/{}", name)),
        Some(StageKind::Local) => {
            if let Ok(path) = path_for_stage(ctx, name, target_stage) {
                let _ = std::fs::remove_file(path);
            }
        }
        Some(StageKind::Remote) => {
            let _ = ctx.store.delete(&format!("{}.db", name));
        }
        None => {}
    }
}

/// The memory backend cannot be a `VACUUM INTO` target or source across
/// backends, so hop through a scratch file on local disk, copy onward from
/// there, and unlink the scratch.
fn copy_from_memory_stage(
    ctx: &ServiceContext,
    source: &Connection,
    name: &str,
    target_stage: u32,
) -> Result<()> {
    let scratch = std::env::temp_dir().join(format!(
        "temp_copy_{}_{:08x}.db",
        std::process::id(),
        rand::random::<u32>()
    ));
    let scratch_path = scratch.to_string_lossy().to_string();
    let _ = std::fs::remove_file(&scratch);

    let result = (|| {
        // The backup inherits the connection's backend unless the target is
        // a URI, so point it at the disk backend explicitly.
        let scratch_uri_target = format!("file:{}?vfs=disk", scratch_path);
        source
            .execute("VACUUM INTO ?1", [&scratch_uri_target])
            .context("failed to vacuum memory database to scratch file")?;

        let scratch_uri = format!("file:{}?vfs=disk", scratch_path);
        let scratch_conn = Connection::open(&scratch_uri)
            .context("failed to open scratch database")?;

        match stage_kind(ctx, target_stage) {
            Some(StageKind::Local) => {
                best_effort_delete_target(ctx, name, target_stage);
                let target_path = path_for_stage(ctx, name, target_stage)?;
                retry_blocking(COPY_MAX_RETRIES, Duration::from_millis(COPY_BACKOFF_MS), || {
                    scratch_conn
                        .execute("VACUUM INTO ?1", [&target_path])
                        .map(|_| ())
                        .map_err(|e| {
                            anyhow::anyhow!("failed to vacuum scratch database to target: {}", e)
                        })
                })
            }
            _ => {
                let target_uri = connection_uri_for_stage(ctx, name, target_stage)?;
                copy_across_vfs(&scratch_conn, &target_uri)
            }
        }
    })();

    let _ = std::fs::remove_file(&scratch);
    result
}

/// Replicate schema and rows into the destination inside one transaction:
/// user tables first (drop, recreate from the source catalog, stream rows
/// through a prepared insert), then user-defined indexes. A failed index is
/// skipped; any table- or row-level failure rolls the whole copy back.
pub fn copy_across_vfs(source: &Connection, target_uri: &str) -> Result<()> {
    let mut target = Connection::open(target_uri)
        .with_context(|| format!("failed to open target database {}", target_uri))?;
    target
        .query_row("SELECT 1", [], |_| Ok(()))
        .context("failed to ping target database")?;

    let tables: Vec<String> = source
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()
        .context("failed to get table list")?;

    let tx = target.transaction().context("failed to begin transaction")?;

    for table in &tables {
        let create_sql: String = source
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type='table' AND name=?1",
                [table],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to get create statement for table {}", table))?;

        tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_identifier(table)), [])
            .with_context(|| format!("failed to drop existing table {}", table))?;
        tx.execute(&create_sql, [])
            .with_context(|| format!("failed to create table {}", table))?;
    }

    for table in &tables {
        let columns: Vec<String> = source
            .prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?
            .query_map([], |row| row.get(1))?
            .collect::<rusqlite::Result<_>>()
            .with_context(|| format!("failed to get table info for {}", table))?;

        if columns.is_empty() {
            continue;
        }

        let column_list = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            column_list,
            placeholders
        );

        let mut insert = tx
            .prepare(&insert_sql)
            .with_context(|| format!("failed to prepare insert for table {}", table))?;

        let mut select = source
            .prepare(&format!(
                "SELECT {} FROM {}",
                column_list,
                quote_identifier(table)
            ))
            .with_context(|| format!("failed to select data from table {}", table))?;

        let mut rows = select.query([])?;
        while let Some(row) = rows.next()? {
            let values: Vec<Value> = (0..columns.len())
                .map(|i| row.get(i))
                .collect::<rusqlite::Result<_>>()
                .with_context(|| format!("failed to read row from table {}", table))?;
            insert
                .execute(params_from_iter(values))
                .with_context(|| format!("failed to insert row into table {}", table))?;
        }
    }

    let indexes: Vec<String> = source
        .prepare(
            "SELECT sql FROM sqlite_master WHERE type='index' AND sql IS NOT NULL AND name NOT LIKE 'sqlite_%'",
        )?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()
        .context("failed to get index list")?;

    for index_sql in indexes {
        if let Err(e) = tx.execute(&index_sql, []) {
            warn!(sql = %index_sql, error = %e, "Failed to create index, continuing");
        }
    }

    tx.commit().context("failed to commit transaction")?;

    debug!("Copied database across storage backends");
    Ok(())
}

/// Double-quote an identifier, doubling embedded quotes.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_connection(path: &str) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE users (id INTEGER PRIMARY KEY, "display name" TEXT, score REAL);
            CREATE INDEX idx_users_score ON users(score);
            INSERT INTO users VALUES (1, 'alice', 9.5);
            INSERT INTO users VALUES (2, 'bo"b', NULL);
            CREATE TABLE empty_table (x BLOB);
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_copy_across_vfs_replicates_schema_rows_and_indexes() {
        let dir = TempDir::new().unwrap();
        let source_path = dir.path().join("src.db");
        let target_path = dir.path().join("dst.db");

        let source = seeded_connection(source_path.to_str().unwrap());
        copy_across_vfs(&source, target_path.to_str().unwrap()).unwrap();

        let target = Connection::open(&target_path).unwrap();
        let count: i64 = target
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let name: String = target
            .query_row(
                "SELECT \"display name\" FROM users WHERE id = 2",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(name, "bo\"b");

        let index_count: i64 = target
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name='idx_users_score'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(index_count, 1);

        // Empty tables are carried as schema only.
        let empty: i64 = target
            .query_row("SELECT COUNT(*) FROM empty_table", [], |r| r.get(0))
            .unwrap();
        assert_eq!(empty, 0);
    }

    #[test]
    fn test_copy_across_vfs_replaces_existing_tables() {
        let dir = TempDir::new().unwrap();
        let source_path = dir.path().join("src.db");
        let target_path = dir.path().join("dst.db");

        let source = seeded_connection(source_path.to_str().unwrap());

        let target = Connection::open(&target_path).unwrap();
        target
            .execute_batch("CREATE TABLE users (old TEXT); INSERT INTO users VALUES ('stale');")
            .unwrap();
        drop(target);

        copy_across_vfs(&source, target_path.to_str().unwrap()).unwrap();

        let target = Connection::open(&target_path).unwrap();
        let count: i64 = target
            .query_row("SELECT COUNT(*) FROM users WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
