//! End-to-end scenarios over the full stack: registered storage backends,
//! the engine opening files through them, the registry and the stage
//! manager moving live databases between tiers.
//!
//! The remote tier is backed by the in-process object store; backend
//! registration is process-wide, so every test shares one store and uses
//! unique database names.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use persisto::config::Config;
use persisto::context::ServiceContext;
use persisto::executor;
use persisto::object_store::{InMemoryObjectStore, ObjectStore};
use persisto::registry::RegistryError;
use persisto::stages;
use persisto::vfs;
use tempfile::TempDir;

fn shared_store() -> Arc<InMemoryObjectStore> {
    static STORE: OnceLock<Arc<InMemoryObjectStore>> = OnceLock::new();
    STORE
        .get_or_init(|| {
            let store = Arc::new(InMemoryObjectStore::new());
            vfs::register_all(Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();
            store
        })
        .clone()
}

fn test_context(configure: impl FnOnce(&mut Config)) -> (Arc<ServiceContext>, TempDir) {
    let store = shared_store();
    let dir = TempDir::new().unwrap();

    let mut config = Config::default();
    config.storage.local.directory_path = dir.path().to_string_lossy().to_string();
    configure(&mut config);

    let ctx = Arc::new(ServiceContext::new(
        config,
        store as Arc<dyn ObjectStore>,
    ));
    (ctx, dir)
}

fn local_file(ctx: &ServiceContext, name: &str) -> std::path::PathBuf {
    std::path::PathBuf::from(format!(
        "{}/{}.db",
        ctx.config.storage.local.directory_path, name
    ))
}

fn stage_of(db: &persisto::Database) -> u32 {
    db.state().read().stage
}

#[test]
fn test_create_at_remote_stage_materializes_object() {
    let (ctx, _dir) = test_context(|_| {});
    let store = shared_store();

    ctx.registry.create(&ctx, "svc_create", 3).unwrap();
    assert!(store.contains("svc_create.db"));
}

#[test]
fn test_create_duplicate_name_conflicts() {
    let (ctx, _dir) = test_context(|_| {});

    ctx.registry.create(&ctx, "svc_dup", 2).unwrap();
    let err = ctx.registry.create(&ctx, "svc_dup", 2).unwrap_err();
    assert!(matches!(err, RegistryError::Conflict));
}

#[test]
fn test_execute_then_query_on_remote_stage() {
    let (ctx, _dir) = test_context(|_| {});
    let db = ctx.registry.create(&ctx, "svc_rt", 3).unwrap();

    executor::execute_database(&ctx, &db, "CREATE TABLE t (n INT)").unwrap();
    let outcome = executor::execute_database(&ctx, &db, "INSERT INTO t VALUES (42)").unwrap();
    assert_eq!(outcome.rows_affected, 1);

    let rows = executor::query_database(&ctx, &db, "SELECT n FROM t").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["n"], serde_json::json!(42.0));

    // The write landed in the remote tier as a whole object.
    assert!(shared_store().contains("svc_rt.db"));
}

#[test]
fn test_round_trip_through_all_stages() {
    let (ctx, _dir) = test_context(|_| {});
    let db = ctx.registry.create(&ctx, "svc_mover", 3).unwrap();

    executor::execute_database(&ctx, &db, "CREATE TABLE x (id INTEGER)").unwrap();
    executor::execute_database(&ctx, &db, "INSERT INTO x VALUES (1)").unwrap();

    // Promote remote → local → memory.
    stages::move_to_stage(&ctx, db.as_ref(), 2).unwrap();
    assert_eq!(stage_of(&db), 2);
    assert_eq!(db.state().read().request_count, 0);
    assert!(local_file(&ctx, "svc_mover").exists());

    stages::move_to_stage(&ctx, db.as_ref(), 1).unwrap();
    assert_eq!(stage_of(&db), 1);

    let rows = executor::query_database(&ctx, &db, "SELECT id FROM x").unwrap();
    assert_eq!(rows[0]["id"], serde_json::json!(1.0));

    // Demote back out to the persistence tier.
    stages::move_to_stage(&ctx, db.as_ref(), 2).unwrap();
    stages::move_to_stage(&ctx, db.as_ref(), 3).unwrap();
    assert_eq!(stage_of(&db), 3);

    let rows = executor::query_database(&ctx, &db, "SELECT id FROM x").unwrap();
    assert_eq!(rows[0]["id"], serde_json::json!(1.0));
}

#[test]
fn test_failed_move_leaves_record_unchanged() {
    let (ctx, _dir) = test_context(|_| {});
    let db = ctx.registry.create(&ctx, "svc_stay", 2).unwrap();

    assert!(stages::move_to_stage(&ctx, db.as_ref(), 9).is_err());
    assert_eq!(stage_of(&db), 2);
}

#[test]
fn test_sync_to_upper_stages_reaches_persistence_tier() {
    let (ctx, _dir) = test_context(|_| {});
    let db = ctx.registry.create(&ctx, "svc_wt", 1).unwrap();

    executor::execute_database(&ctx, &db, "CREATE TABLE w (v TEXT)").unwrap();
    executor::execute_database(&ctx, &db, "INSERT INTO w VALUES ('payload')").unwrap();

    stages::sync_to_upper_stages(&ctx, db.as_ref());

    // Record stays put; copies exist in every upper tier.
    assert_eq!(stage_of(&db), 1);
    assert!(local_file(&ctx, "svc_wt").exists());
    assert!(shared_store().contains("svc_wt.db"));

    let remote_uri = stages::connection_uri_for_stage(&ctx, "svc_wt", 3).unwrap();
    let conn = rusqlite_open(&remote_uri);
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM w", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_demotion_skipped_for_recently_accessed_database() {
    let (ctx, _dir) = test_context(|_| {});
    let db = ctx.registry.create(&ctx, "svc_fresh", 1).unwrap();

    executor::execute_database(&ctx, &db, "CREATE TABLE f (x INT)").unwrap();

    // Default timeout is five minutes; the record was just touched.
    stages::demote_to_farther_stage(&ctx, db.as_ref());
    assert_eq!(stage_of(&db), 1);
}

#[test]
fn test_demotion_after_inactivity_walks_farther() {
    let (ctx, _dir) = test_context(|c| {
        c.settings.stage_timeout_secs = 0;
    });
    let db = ctx.registry.create(&ctx, "svc_cold", 1).unwrap();

    executor::execute_database(&ctx, &db, "CREATE TABLE c (x INT)").unwrap();
    executor::execute_database(&ctx, &db, "INSERT INTO c VALUES (9)").unwrap();

    stages::demote_to_farther_stage(&ctx, db.as_ref());
    assert_eq!(stage_of(&db), 2);

    stages::demote_to_farther_stage(&ctx, db.as_ref());
    assert_eq!(stage_of(&db), 3);

    // Farthest stage: a further demotion is a no-op.
    stages::demote_to_farther_stage(&ctx, db.as_ref());
    assert_eq!(stage_of(&db), 3);

    let rows = executor::query_database(&ctx, &db, "SELECT x FROM c").unwrap();
    assert_eq!(rows[0]["x"], serde_json::json!(9.0));
}

#[test]
fn test_delete_reclaims_nonactive_tiers_and_unlinks() {
    let (ctx, _dir) = test_context(|_| {});
    let store = shared_store();
    let db = ctx.registry.create(&ctx, "svc_del", 2).unwrap();

    executor::execute_database(&ctx, &db, "CREATE TABLE d (x INT)").unwrap();
    stages::sync_to_upper_stages(&ctx, db.as_ref());
    assert!(store.contains("svc_del.db"));

    ctx.registry.delete(&ctx, &db).unwrap();

    // The remote copy is reclaimed; the active-stage copy is not touched by
    // the sweep, and the record is gone.
    assert!(!store.contains("svc_del.db"));
    assert!(matches!(
        ctx.registry.find_by_name("svc_del"),
        Err(RegistryError::NotFound)
    ));
}

#[test]
fn test_registry_seeding_from_remote_listing() {
    let (ctx, _dir) = test_context(|_| {});
    let store = shared_store();

    store.put("svc_seeded.db", b"not-read-during-seed").unwrap();
    store.put("svc_seeded.db-journal", b"x").unwrap();

    ctx.registry.seed_from_remote(&ctx).unwrap();

    let db = ctx.registry.find_by_name("svc_seeded").unwrap();
    assert_eq!(stage_of(&db), 3);
    assert!(ctx.registry.find_by_name("svc_seeded.db-journal").is_err());
}

#[tokio::test]
async fn test_query_batch_preserves_order_and_isolates_failures() {
    let (ctx, _dir) = test_context(|c| {
        // Keep the trigger quiet for this test.
        c.settings.auto_stage_movement = false;
    });
    let db = ctx.registry.create(&ctx, "svc_batch", 2).unwrap();

    let queries: Vec<String> = (0..8)
        .map(|i| {
            if i == 3 {
                "SELECTT broken".to_string()
            } else {
                format!("SELECT {} AS v", i)
            }
        })
        .collect();

    let results = executor::run_queries(Arc::clone(&ctx), db, queries).await;
    assert_eq!(results.len(), 8);

    for (i, result) in results.iter().enumerate() {
        if i == 3 {
            assert!(result.is_err());
        } else {
            let rows = result.as_ref().unwrap();
            assert_eq!(rows[0]["v"], serde_json::json!(i as f64));
        }
    }
}

#[tokio::test]
async fn test_execute_batch_isolates_failures() {
    let (ctx, _dir) = test_context(|c| {
        c.settings.auto_stage_movement = false;
        c.settings.auto_sync_enabled = false;
    });
    let db = ctx.registry.create(&ctx, "svc_exec_batch", 2).unwrap();

    let results = executor::run_executes(
        Arc::clone(&ctx),
        db,
        vec![
            "CREATE TABLE eb (x INT)".to_string(),
            "INSERT INTO missing VALUES (1)".to_string(),
            "INSERT INTO eb VALUES (5)".to_string(),
        ],
    )
    .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert_eq!(results[2].as_ref().unwrap().rows_affected, 1);
}

#[tokio::test]
async fn test_promotion_trigger_moves_hot_database_closer() {
    let (ctx, _dir) = test_context(|c| {
        c.settings.request_count_threshold = 2;
    });
    let db = ctx.registry.create(&ctx, "svc_hot", 3).unwrap();

    executor::execute_database(&ctx, &db, "CREATE TABLE h (x INT)").unwrap();

    // Reset the counter bumps from setup so the trigger fires exactly on
    // the two reads below.
    db.state().write().request_count = 0;

    let results = executor::run_queries(
        Arc::clone(&ctx),
        Arc::clone(&db),
        vec!["SELECT 1".to_string(), "SELECT 2".to_string()],
    )
    .await;
    assert!(results.iter().all(|r| r.is_ok()));

    // Promotion runs as a background blocking task.
    for _ in 0..100 {
        if stage_of(&db) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stage_of(&db), 2);
    assert_eq!(db.state().read().request_count, 0);
}

#[tokio::test]
async fn test_monitor_sweep_schedules_demotion_for_idle_databases() {
    let (ctx, _dir) = test_context(|c| {
        c.settings.stage_timeout_secs = 0;
    });
    let db = ctx.registry.create(&ctx, "svc_idle", 1).unwrap();
    executor::execute_database(&ctx, &db, "CREATE TABLE m (x INT)").unwrap();

    stages::monitor::sweep(&ctx);

    for _ in 0..100 {
        if stage_of(&db) > 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(stage_of(&db) > 1);
}

fn rusqlite_open(uri: &str) -> rusqlite::Connection {
    rusqlite::Connection::open(uri).unwrap()
}
