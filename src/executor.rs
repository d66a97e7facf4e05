//! Query executor: resolves a record's current stage into a connection URI,
//! runs statements, and converts results into JSON-friendly shapes.
//!
//! Read batches fan out across a small worker pool; write batches run
//! sequentially. Every invocation stamps the record's access counters, and
//! batch completion applies the promotion and write-through triggers.
//!
//! All engine work is blocking and runs on blocking threads; the async
//! entry points only coordinate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{types::Value, Connection};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::context::ServiceContext;
use crate::registry::Database;
use crate::stages;

/// Upper bound on concurrent read statements per request.
pub const MAX_QUERY_WORKERS: usize = 10;

/// How long the engine retries a busy database before surfacing the error.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Rows as column-keyed maps. Blobs become strings and 64-bit integers
/// become doubles so results survive JSON transport unchanged.
pub type QueryRows = Vec<serde_json::Map<String, serde_json::Value>>;

/// Result of one write statement.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    #[serde(rename = "RowsAffected")]
    pub rows_affected: u64,
    #[serde(rename = "LastInsertID")]
    pub last_insert_id: i64,
}

/// True when the statement's first token mutates data.
pub fn is_write_operation(query: &str) -> bool {
    let trimmed = query.trim_start();
    const WRITE_OPERATIONS: [&str; 6] = ["INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER"];

    WRITE_OPERATIONS.iter().any(|op| {
        trimmed.len() >= op.len()
            && trimmed[..op.len()].eq_ignore_ascii_case(op)
            && trimmed[op.len()..]
                .chars()
                .next()
                .map_or(true, |c| c.is_whitespace())
    })
}

fn open_connection(uri: &str) -> Result<Connection> {
    let connection =
        Connection::open(uri).with_context(|| format!("failed to open connection {}", uri))?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

/// Run one read statement against the record's current stage.
pub fn query_database(ctx: &ServiceContext, database: &Database, query: &str) -> Result<QueryRows> {
    database.handle_access();

    let uri = database.connection_uri(ctx)?;
    let connection = open_connection(&uri)?;
    connection
        .query_row("SELECT 1", [], |_| Ok(()))
        .context("database ping failed")?;

    debug!(database = database.name(), uri, "Running query");

    let mut statement = connection
        .prepare(query)
        .with_context(|| format!("failed to prepare query: {}", query))?;
    let column_names: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(|c| c.to_string())
        .collect();

    let mut rows = statement.query([])?;
    let mut results = QueryRows::new();
    while let Some(row) = rows.next()? {
        let mut record = serde_json::Map::new();
        for (i, column) in column_names.iter().enumerate() {
            let value: Value = row.get(i)?;
            record.insert(column.clone(), sql_value_to_json(value));
        }
        results.push(record);
    }

    Ok(results)
}

/// Run one write statement against the record's current stage.
pub fn execute_database(
    ctx: &ServiceContext,
    database: &Database,
    query: &str,
) -> Result<ExecOutcome> {
    database.handle_access();

    let uri = database.connection_uri(ctx)?;
    let connection = open_connection(&uri)?;

    debug!(database = database.name(), uri, "Executing statement");

    let rows_affected = connection
        .execute(query, [])
        .with_context(|| format!("failed to execute statement: {}", query))?;

    Ok(ExecOutcome {
        rows_affected: rows_affected as u64,
        last_insert_id: connection.last_insert_rowid(),
    })
}

/// Run a read batch through the worker pool. Output order equals input
/// order; each slot succeeds or fails independently.
pub async fn run_queries(
    ctx: Arc<ServiceContext>,
    database: Arc<Database>,
    queries: Vec<String>,
) -> Vec<Result<QueryRows>> {
    let workers = MAX_QUERY_WORKERS.min(queries.len().max(1));
    let semaphore = Arc::new(Semaphore::new(workers));

    let mut handles = Vec::with_capacity(queries.len());
    for (index, query) in queries.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let ctx = Arc::clone(&ctx);
        let database = Arc::clone(&database);

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result =
                tokio::task::spawn_blocking(move || query_database(&ctx, &database, &query)).await;
            let result = match result {
                Ok(inner) => inner,
                Err(e) => Err(anyhow::anyhow!("query worker panicked: {}", e)),
            };
            (index, result)
        }));
    }

    let mut results: Vec<Option<Result<QueryRows>>> = Vec::new();
    results.resize_with(handles.len(), || None);
    for handle in handles {
        match handle.await {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => error!(error = %e, "Query task join failed"),
        }
    }

    apply_promotion_trigger(&ctx, &database);

    results
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(anyhow::anyhow!("query worker lost"))))
        .collect()
}

/// Run a write batch sequentially. A failed statement marks its slot and
/// the batch continues.
pub async fn run_executes(
    ctx: Arc<ServiceContext>,
    database: Arc<Database>,
    queries: Vec<String>,
) -> Vec<Result<ExecOutcome>> {
    let any_write = queries.iter().any(|q| is_write_operation(q));

    let results = {
        let ctx = Arc::clone(&ctx);
        let database = Arc::clone(&database);
        tokio::task::spawn_blocking(move || {
            queries
                .iter()
                .map(|query| execute_database(&ctx, &database, query))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_else(|e| vec![Err(anyhow::anyhow!("execute worker panicked: {}", e))])
    };

    apply_promotion_trigger(&ctx, &database);
    if any_write {
        schedule_write_through(&ctx, &database);
    }

    results
}

/// Schedule a promotion once the record's request counter crosses the
/// configured threshold.
fn apply_promotion_trigger(ctx: &Arc<ServiceContext>, database: &Arc<Database>) {
    if !ctx.config.settings.auto_stage_movement {
        return;
    }

    let request_count = database.state().read().request_count;
    if request_count < ctx.config.settings.request_count_threshold {
        return;
    }

    info!(
        database = database.name(),
        request_count, "Scheduling database stage promotion"
    );

    let ctx = Arc::clone(ctx);
    let database = Arc::clone(database);
    tokio::task::spawn_blocking(move || {
        stages::promote_to_closer_stage(&ctx, database.as_ref());
    });
}

/// Schedule write-through synchronization to the upper tiers.
fn schedule_write_through(ctx: &Arc<ServiceContext>, database: &Arc<Database>) {
    if !ctx.config.settings.auto_sync_enabled {
        return;
    }

    let ctx = Arc::clone(ctx);
    let database = Arc::clone(database);
    tokio::task::spawn_blocking(move || {
        stages::sync_to_upper_stages(&ctx, database.as_ref());
    });
}

fn sql_value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        // 64-bit integers don't survive JSON in full precision anyway;
        // report them as doubles so clients see one numeric type.
        Value::Integer(i) => serde_json::Number::from_f64(i as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s),
        Value::Blob(b) => serde_json::Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}
