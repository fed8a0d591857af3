//! Worker pool integration tests against real worker processes.
//!
//! Each test spawns the actual `datachat worker` binary, so these cover the
//! full path: framed stdio protocol, process supervision, deadlines, crash
//! repair, and shutdown.

use datachat::DatasetRef;
use datachat::config::PoolConfig;
use datachat::error::PoolError;
use datachat::pool::slot::SlotState;
use datachat::pool::{PoolHandle, ProcessSpawner, WorkerPool, WorkerSpawner};
use std::sync::Arc;
use std::time::Duration;

/// A query that burns CPU long enough for deadline/kill tests to observe it.
const SLOW_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                          WHERE x < 1000000000) SELECT COUNT(*) FROM c";

/// Like SLOW_QUERY but finite enough to finish within the default timeout,
/// for crash-requeue tests where the retried job must succeed.
const MEDIUM_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                            WHERE x < 20000000) SELECT COUNT(*) FROM c";

fn spawner() -> Arc<dyn WorkerSpawner> {
    Arc::new(ProcessSpawner::new(env!("CARGO_BIN_EXE_datachat").into()))
}

fn config(pool_size: usize) -> PoolConfig {
    PoolConfig {
        pool_size,
        queue_capacity: 16,
        memory_limit_mb: 8192,
        query_timeout_ms: 60_000,
        max_crash_requeues: 1,
        shutdown_grace_ms: 5_000,
        worker_path: None,
    }
}

async fn start(config: PoolConfig) -> PoolHandle {
    WorkerPool::start(config, spawner())
        .await
        .expect("pool start")
}

fn fixture_dataset(dir: &tempfile::TempDir) -> DatasetRef {
    let path = dir.path().join("metrics.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT, value REAL);
         INSERT INTO events VALUES (1, 'click', 1.0), (2, 'view', NULL), (3, 'click', 2.5);",
    )
    .unwrap();
    DatasetRef {
        id: "metrics".into(),
        path,
    }
}

#[tokio::test]
async fn queries_run_against_attached_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = fixture_dataset(&dir);
    let pool = start(config(2)).await;

    let result = pool
        .execute_query(
            None,
            "SELECT kind, value FROM metrics.events ORDER BY id",
            vec![dataset],
            0,
            10,
            0,
        )
        .await
        .expect("query result");

    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert_eq!(result.total_rows, 3);
    assert_eq!(result.rows[0][0], serde_json::json!("click"));
    // NULL survives the wire distinct from zero.
    assert!(result.rows[1][1].is_null());

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn semantic_errors_come_back_inline() {
    let pool = start(config(1)).await;

    let result = pool
        .execute_query(None, "SELECT missing_column FROM nowhere", vec![], 0, 10, 0)
        .await
        .expect("job resolves normally");

    let error = result.error.expect("inline error");
    assert_eq!(
        error.kind,
        datachat::pool::protocol::QueryErrorKind::Semantic
    );

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn oversubmitted_pool_resolves_everything_and_repairs_to_size() {
    let pool = start(config(2)).await;

    let submissions: Vec<_> = (0..6)
        .map(|n| {
            let pool = pool.clone();
            async move {
                pool.execute_query(None, format!("SELECT {n} + {n}"), vec![], 0, 10, 0)
                    .await
            }
        })
        .collect();
    let results = futures::future::join_all(submissions).await;

    for (n, result) in results.into_iter().enumerate() {
        let result = result.expect("job resolved");
        assert!(result.error.is_none());
        assert_eq!(result.rows[0][0], serde_json::json!(2 * n as i64));
    }

    let health = pool.health().await.unwrap();
    assert_eq!(health.live_workers, 2);
    assert_eq!(health.jobs_executed, 6);
    assert_eq!(health.queue_depth, 0);

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn timed_out_job_kills_the_worker_and_the_queue_keeps_moving() {
    // Single slot: the second job must wait behind the doomed one and still
    // run after the replacement comes up.
    let pool = start(config(1)).await;

    let slow = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute_query(None, SLOW_QUERY, vec![], 0, 10, 500).await })
    };
    // Give the slow job time to be dispatched before queueing the next one.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let quick = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute_query(None, "SELECT 7", vec![], 0, 10, 0).await })
    };

    let slow_result = slow.await.unwrap();
    assert!(
        matches!(slow_result, Err(PoolError::QueryTimeout { timeout_ms: 500 })),
        "expected timeout, got {slow_result:?}"
    );

    let quick_result = quick.await.unwrap().expect("queued job runs after repair");
    assert_eq!(quick_result.rows[0][0], serde_json::json!(7));

    let health = pool.health().await.unwrap();
    assert_eq!(health.live_workers, 1);
    assert!(health.timeouts >= 1);

    pool.shutdown(Duration::from_secs(2)).await;
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("kill spawns");
    assert!(status.success(), "kill -9 {pid} failed");
}

#[cfg(unix)]
async fn busy_worker_pid(pool: &PoolHandle) -> u32 {
    for _ in 0..50 {
        let health = pool.health().await.unwrap();
        if let Some(slot) = health
            .slots
            .iter()
            .find(|slot| slot.state == SlotState::Busy)
        {
            return slot.pid.expect("busy slot has a pid");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("no worker went busy");
}

#[cfg(unix)]
#[tokio::test]
async fn crashed_job_is_requeued_once_and_succeeds_elsewhere() {
    let pool = start(config(2)).await;

    let job = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute_query(None, MEDIUM_QUERY, vec![], 0, 10, 0).await })
    };

    let pid = busy_worker_pid(&pool).await;
    kill_pid(pid);

    // First crash requeues; the retry lands on a fresh process and finishes.
    let result = job.await.unwrap().expect("requeued job succeeds");
    assert!(result.error.is_none());
    assert_eq!(result.rows[0][0], serde_json::json!(20_000_000));

    let health = pool.health().await.unwrap();
    assert!(health.crashes >= 1);
    assert_eq!(health.live_workers, 2);

    pool.shutdown(Duration::from_secs(2)).await;
}

#[cfg(unix)]
#[tokio::test]
async fn with_no_requeues_a_crash_surfaces_to_the_submitter() {
    let mut config = config(1);
    config.max_crash_requeues = 0;
    let pool = start(config).await;

    let job = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute_query(None, SLOW_QUERY, vec![], 0, 10, 0).await })
    };

    let pid = busy_worker_pid(&pool).await;
    kill_pid(pid);

    let result = job.await.unwrap();
    assert!(
        matches!(result, Err(PoolError::WorkerCrash)),
        "expected WorkerCrash, got {result:?}"
    );

    // The pool repaired itself and keeps serving.
    let after = pool
        .execute_query(None, "SELECT 1", vec![], 0, 10, 0)
        .await
        .expect("pool serves after crash");
    assert!(after.error.is_none());

    pool.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn shutdown_rejects_new_work() {
    let pool = start(config(1)).await;

    let before = pool
        .execute_query(None, "SELECT 1", vec![], 0, 10, 0)
        .await
        .expect("pre-shutdown job");
    assert!(before.error.is_none());

    pool.shutdown(Duration::from_secs(2)).await;

    let after = pool.execute_query(None, "SELECT 1", vec![], 0, 10, 0).await;
    assert!(matches!(after, Err(PoolError::ShuttingDown)));
}

#[tokio::test]
async fn schema_and_profile_ride_the_same_pool() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = fixture_dataset(&dir);
    let pool = start(config(1)).await;

    let schema = match pool.schema(dataset.clone()).await.unwrap() {
        datachat::pool::JobOutcome::Schema(schema) => schema,
        other => panic!("expected schema, got {other:?}"),
    };
    assert_eq!(schema.tables.len(), 1);
    assert_eq!(schema.tables[0].name, "events");
    assert_eq!(schema.tables[0].row_count, 3);

    let profile = match pool.profile(dataset, "events").await.unwrap() {
        datachat::pool::JobOutcome::Profile(profile) => profile,
        other => panic!("expected profile, got {other:?}"),
    };
    let value = profile
        .columns
        .iter()
        .find(|column| column.name == "value")
        .unwrap();
    assert_eq!(value.null_count, 1);

    pool.shutdown(Duration::from_secs(2)).await;
}
