//! End-to-end tests driving the full engine runtime: controller loop,
//! worker loops, and janitor ticker against a real database-backed bus.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use strata_core::bus::{send_message, PgBus, TaskQueueMessage, TASKS_QUEUE};
use strata_core::janitor::JanitorConfig;
use strata_core::{ids, submit, Engine, EngineConfig};
use strata_db::models::{JobStatus, TaskStatus};
use strata_db::queries::{jobs as job_db, tasks as task_db};
use strata_test_utils::TestDb;

use fixtures::{handler_registry, job_registry, ContainerListJob, DiamondJob};

/// Spawn an engine over the given pool; returns the cancellation token
/// and join handle.
fn spawn_engine(
    pool: &PgPool,
    config: EngineConfig,
) -> (CancellationToken, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let engine = Arc::new(Engine::new(
        pool.clone(),
        Arc::new(PgBus::new(pool.clone())),
        Arc::new(job_registry()),
        Arc::new(handler_registry()),
        config,
    ));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(engine.run(cancel.clone()));
    (cancel, handle)
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_concurrency: 4,
        poll_interval: Duration::from_millis(25),
        // Effectively disabled unless a test opts in.
        janitor_interval: Duration::from_secs(3600),
        janitor: JanitorConfig::default(),
    }
}

/// Poll until the job reaches a terminal status or the deadline passes.
async fn wait_for_terminal(pool: &PgPool, job_id: &str) -> strata_db::models::Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let job = job_db::get_job(pool, job_id).await.unwrap().unwrap();
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not reach a terminal status in time (status {}, stage {})",
            job.status,
            job.stage
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn diamond_job_runs_to_completion() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();

    let params = json!({
        "container_name": "rasters",
        "blob_names": ["a.tif", "bb.tif", "ccc.tif", "dddd.tif", "eeeee.tif"],
    });
    let receipt = submit::submit(&pool, &bus, &jobs, DiamondJob::JOB_TYPE, &params)
        .await
        .unwrap();

    let (cancel, handle) = spawn_engine(&pool, fast_config());
    let job = wait_for_terminal(&pool, &receipt.job_id).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stage, 3);
    assert_eq!(job.result_data.as_ref().unwrap()["summary"]["total_blobs"], json!(5));

    // Stage snapshots exist for every stage.
    for stage in ["1", "2", "3"] {
        assert!(
            job.stage_results.get(stage).is_some(),
            "missing stage_results[{stage}]"
        );
    }

    db.finish().await;
}

#[tokio::test]
async fn failed_fan_out_is_escalated_by_the_janitor() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();

    let params = json!({
        "container_name": "rasters",
        "blob_names": ["a.tif", "corrupt.tif", "c.tif"],
    });
    let receipt = submit::submit(&pool, &bus, &jobs, ContainerListJob::JOB_TYPE, &params)
        .await
        .unwrap();

    let config = EngineConfig {
        janitor_interval: Duration::from_millis(250),
        ..fast_config()
    };
    let (cancel, handle) = spawn_engine(&pool, config);
    let job = wait_for_terminal(&pool, &receipt.job_id).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_details.as_deref().unwrap().contains("unreadable blob"));
    let partial = job.result_data.as_ref().unwrap()["partial_results"]
        .as_array()
        .unwrap();
    assert_eq!(partial.len(), 3, "listing plus two good analyses survive");

    db.finish().await;
}

#[tokio::test]
async fn duplicate_task_message_converges_to_single_delivery_state() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();

    let params = json!({"x": 42});
    let receipt = submit::submit(&pool, &bus, &jobs, "echo_singleton", &params)
        .await
        .unwrap();

    // Forge a duplicate of the task message the controller will produce.
    // One copy may arrive before the row exists and one after completion;
    // the status-gated guards absorb both.
    let duplicate = TaskQueueMessage {
        task_id: ids::task_id(&receipt.job_id, 1, "echo"),
        parent_job_id: receipt.job_id.clone(),
        task_type: "echo".into(),
        stage: 1,
        parameters: params.clone(),
        correlation_id: uuid::Uuid::new_v4(),
    };
    send_message(&bus, TASKS_QUEUE, &duplicate).await.unwrap();

    let (cancel, handle) = spawn_engine(&pool, fast_config());
    let job = wait_for_terminal(&pool, &receipt.job_id).await;

    // Inject another duplicate after the fact and give the engine a
    // moment to drain it.
    send_message(&bus, TASKS_QUEUE, &duplicate).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data, Some(json!({"echoed": {"x": 42}})));

    let tasks = task_db::list_tasks_for_job(&pool, &receipt.job_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].retry_count, 0);

    let job = job_db::get_job(&pool, &receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed, "duplicates changed nothing");

    db.finish().await;
}

#[tokio::test]
async fn engine_drains_a_burst_of_jobs() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();

    let mut job_ids = Vec::new();
    for n in 0..5 {
        let params = json!({
            "container_name": format!("container-{n}"),
            "blob_names": ["a.tif", "b.tif"],
        });
        let receipt = submit::submit(&pool, &bus, &jobs, ContainerListJob::JOB_TYPE, &params)
            .await
            .unwrap();
        job_ids.push(receipt.job_id);
    }

    let (cancel, handle) = spawn_engine(&pool, fast_config());
    for job_id in &job_ids {
        let job = wait_for_terminal(&pool, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_data.as_ref().unwrap()["analyzed"], json!(2));
    }
    cancel.cancel();
    handle.await.unwrap().unwrap();

    db.finish().await;
}
