//! Controller and worker behavior against a real database: task
//! generation, redelivery tolerance, the CAS entry guard, and the stage
//! completion protocol.

mod fixtures;

use serde_json::json;

use strata_core::bus::{
    receive_message, JobQueueMessage, MessageBus, PgBus, TaskQueueMessage, JOBS_QUEUE, TASKS_QUEUE,
};
use strata_core::{controller, ids, submit, worker};
use strata_db::models::{JobStatus, TaskStatus};
use strata_db::queries::{jobs as job_db, tasks as task_db};
use strata_test_utils::TestDb;

use fixtures::{handler_registry, job_registry, pump_until_quiet, ContainerListJob, DiamondJob};

/// Submit a container-list job and return its ID.
async fn submit_container_job(
    pool: &sqlx::PgPool,
    bus: &PgBus,
    registry: &strata_core::JobRegistry,
    job_type: &str,
    blobs: &[&str],
) -> String {
    let params = json!({"container_name": "rasters", "blob_names": blobs});
    submit::submit(pool, bus, registry, job_type, &params)
        .await
        .unwrap()
        .job_id
}

#[tokio::test]
async fn controller_generates_stage_one_task_and_message() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();

    let job_id =
        submit_container_job(&pool, &bus, &jobs, ContainerListJob::JOB_TYPE, &["a.tif"]).await;

    let (message, token) = receive_message::<JobQueueMessage>(&bus, JOBS_QUEUE)
        .await
        .unwrap()
        .unwrap();
    controller::process_job_message(&pool, &bus, &jobs, &message)
        .await
        .unwrap();
    bus.ack(token).await.unwrap();

    // One stage-1 task with the deterministic singleton unit.
    let tasks = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_id, ids::task_id(&job_id, 1, "list"));
    assert_eq!(tasks[0].status, TaskStatus::Queued);
    assert_eq!(tasks[0].task_index, 0);

    // Job moved to processing; one task message waiting.
    let job = job_db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(bus.depth(TASKS_QUEUE).await.unwrap().visible, 1);

    db.finish().await;
}

#[tokio::test]
async fn redelivered_stage_message_adds_nothing() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();

    let job_id =
        submit_container_job(&pool, &bus, &jobs, ContainerListJob::JOB_TYPE, &["a.tif"]).await;

    let (message, token) = receive_message::<JobQueueMessage>(&bus, JOBS_QUEUE)
        .await
        .unwrap()
        .unwrap();
    controller::process_job_message(&pool, &bus, &jobs, &message)
        .await
        .unwrap();
    // Broker redelivers the same stage message (never acked).
    controller::process_job_message(&pool, &bus, &jobs, &message)
        .await
        .unwrap();
    bus.ack(token).await.unwrap();

    let tasks = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap();
    assert_eq!(tasks.len(), 1, "replay must not duplicate tasks");

    // The replay re-sends messages only for still-queued tasks, so at
    // most one duplicate task message exists; the worker's CAS absorbs it.
    let depth = bus.depth(TASKS_QUEUE).await.unwrap();
    assert_eq!(depth.visible, 2);

    db.finish().await;
}

#[tokio::test]
async fn stale_stage_message_is_dropped() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();
    let handlers = handler_registry();

    let job_id =
        submit_container_job(&pool, &bus, &jobs, ContainerListJob::JOB_TYPE, &["a.tif"]).await;
    pump_until_quiet(&pool, &bus, &jobs, &handlers).await.unwrap();

    let job = job_db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let task_count = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap().len();

    // A late stage-1 redelivery after the job completed and advanced.
    let stale = JobQueueMessage {
        job_id: job_id.clone(),
        job_type: ContainerListJob::JOB_TYPE.into(),
        stage: 1,
        parameters: job.parameters.clone(),
        attempt: 1,
        correlation_id: uuid::Uuid::new_v4(),
    };
    controller::process_job_message(&pool, &bus, &jobs, &stale)
        .await
        .unwrap();

    let after = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap();
    assert_eq!(after.len(), task_count, "stale message must not add tasks");
    assert_eq!(bus.depth(TASKS_QUEUE).await.unwrap().visible, 0);

    db.finish().await;
}

#[tokio::test]
async fn duplicate_task_delivery_is_a_no_op() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();
    let handlers = handler_registry();

    let job_id =
        submit_container_job(&pool, &bus, &jobs, ContainerListJob::JOB_TYPE, &["a.tif"]).await;

    let (message, token) = receive_message::<JobQueueMessage>(&bus, JOBS_QUEUE)
        .await
        .unwrap()
        .unwrap();
    controller::process_job_message(&pool, &bus, &jobs, &message)
        .await
        .unwrap();
    bus.ack(token).await.unwrap();

    let (task_message, token) = receive_message::<TaskQueueMessage>(&bus, TASKS_QUEUE)
        .await
        .unwrap()
        .unwrap();

    // First delivery executes the handler and completes the task.
    worker::process_task_message(&pool, &bus, &jobs, &handlers, &task_message)
        .await
        .unwrap();
    let task = task_db::get_task(&pool, &task_message.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let result_snapshot = task.result_data.clone();

    // Second delivery of the same message: CAS misses, nothing changes.
    worker::process_task_message(&pool, &bus, &jobs, &handlers, &task_message)
        .await
        .unwrap();
    let task = task_db::get_task(&pool, &task_message.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result_data, result_snapshot);
    bus.ack(token).await.unwrap();

    db.finish().await;
}

#[tokio::test]
async fn unknown_task_type_fails_the_task() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();
    // Registry without the analyze handler.
    let mut handlers = strata_core::HandlerRegistry::new();
    handlers.register(fixtures::ListBlobsHandler);

    let job_id =
        submit_container_job(&pool, &bus, &jobs, ContainerListJob::JOB_TYPE, &["a.tif"]).await;
    pump_until_quiet(&pool, &bus, &jobs, &handlers).await.unwrap();

    let tasks = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap();
    let analyze = tasks.iter().find(|t| t.stage == 2).unwrap();
    assert_eq!(analyze.status, TaskStatus::Failed);
    assert_eq!(
        analyze.error_details.as_deref(),
        Some("unknown task_type: analyze_single_blob")
    );

    // Stage settled with a failure: the job waits for the janitor.
    let job = job_db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);

    db.finish().await;
}

#[tokio::test]
async fn singleton_job_completes_end_to_end() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();
    let handlers = handler_registry();

    let receipt = submit::submit(
        &pool,
        &bus,
        &jobs,
        "echo_singleton",
        &json!({"x": 1}),
    )
    .await
    .unwrap();

    pump_until_quiet(&pool, &bus, &jobs, &handlers).await.unwrap();

    let job = job_db::get_job(&pool, &receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stage, 1, "total_stages=1 never advances");
    assert_eq!(job.result_data, Some(json!({"echoed": {"x": 1}})));

    // No stage-advancement message was ever produced.
    assert_eq!(bus.depth(JOBS_QUEUE).await.unwrap().visible, 0);

    db.finish().await;
}

#[tokio::test]
async fn fan_out_happy_path_preserves_lineage() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();
    let handlers = handler_registry();

    let job_id = submit_container_job(
        &pool,
        &bus,
        &jobs,
        ContainerListJob::JOB_TYPE,
        &["a.tif", "b.tif", "c.tif"],
    )
    .await;
    pump_until_quiet(&pool, &bus, &jobs, &handlers).await.unwrap();

    let job = job_db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stage, 2);
    assert_eq!(job.result_data.as_ref().unwrap()["analyzed"], json!(3));

    // Stage-2 task IDs are exactly the deterministic per-blob IDs.
    let tasks = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap();
    let stage2: Vec<&strata_db::models::Task> =
        tasks.iter().filter(|t| t.stage == 2).collect();
    assert_eq!(stage2.len(), 3);
    for blob in ["a.tif", "b.tif", "c.tif"] {
        assert!(
            stage2.iter().any(|t| t.task_id == ids::task_id(&job_id, 2, blob)),
            "missing deterministic task for {blob}"
        );
    }

    // The persisted stage-1 snapshot carries the listing result.
    assert_eq!(
        job.stage_results["1"][0]["result"]["blob_names"],
        json!(["a.tif", "b.tif", "c.tif"])
    );

    db.finish().await;
}

#[tokio::test]
async fn fan_out_failure_leaves_job_for_the_janitor() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();
    let handlers = handler_registry();

    let job_id = submit_container_job(
        &pool,
        &bus,
        &jobs,
        ContainerListJob::JOB_TYPE,
        &["a.tif", "corrupt.tif", "c.tif"],
    )
    .await;
    pump_until_quiet(&pool, &bus, &jobs, &handlers).await.unwrap();

    let job = job_db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing, "worker never fails the job");

    let tasks = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap();
    let stage2: Vec<&strata_db::models::Task> =
        tasks.iter().filter(|t| t.stage == 2).collect();
    let completed = stage2.iter().filter(|t| t.status == TaskStatus::Completed).count();
    let failed = stage2.iter().filter(|t| t.status == TaskStatus::Failed).count();
    assert_eq!((completed, failed), (2, 1));

    let corrupt = stage2
        .iter()
        .find(|t| t.task_id == ids::task_id(&job_id, 2, "corrupt.tif"))
        .unwrap();
    assert!(corrupt.error_details.as_deref().unwrap().contains("unreadable blob"));

    db.finish().await;
}

#[tokio::test]
async fn diamond_fan_in_aggregates_all_results() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();
    let handlers = handler_registry();

    let blobs = ["a.tif", "bb.tif", "ccc.tif", "dddd.tif", "eeeee.tif"];
    let job_id =
        submit_container_job(&pool, &bus, &jobs, DiamondJob::JOB_TYPE, &blobs).await;
    pump_until_quiet(&pool, &bus, &jobs, &handlers).await.unwrap();

    let job = job_db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stage, 3);

    // Exactly one stage-3 task, with the synthesized aggregate identity.
    let tasks = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap();
    let stage3: Vec<&strata_db::models::Task> =
        tasks.iter().filter(|t| t.stage == 3).collect();
    assert_eq!(stage3.len(), 1);
    assert_eq!(stage3[0].task_id, ids::task_id(&job_id, 3, "aggregate"));

    // The aggregator saw all five analyses.
    let summary = &job.result_data.as_ref().unwrap()["summary"];
    assert_eq!(summary["total_blobs"], json!(5));
    let expected_size: f64 = blobs.iter().map(|b| b.len() as f64).sum();
    assert_eq!(summary["total_size_mb"], json!(expected_size));

    db.finish().await;
}

#[tokio::test]
async fn empty_fan_out_completes_immediately() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();
    let handlers = handler_registry();

    let job_id =
        submit_container_job(&pool, &bus, &jobs, ContainerListJob::JOB_TYPE, &[]).await;
    pump_until_quiet(&pool, &bus, &jobs, &handlers).await.unwrap();

    let job = job_db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result_data.as_ref().unwrap()["analyzed"], json!(0));

    // Only the stage-1 listing task ever existed.
    let tasks = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap();
    assert_eq!(tasks.len(), 1);

    db.finish().await;
}

#[tokio::test]
async fn concurrent_last_tasks_advance_exactly_once() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let bus = PgBus::new(pool.clone());
    let jobs = job_registry();
    let handlers = handler_registry();

    let job_id = submit_container_job(
        &pool,
        &bus,
        &jobs,
        DiamondJob::JOB_TYPE,
        &["a.tif", "b.tif"],
    )
    .await;

    // Run stage 1 and generate stage 2.
    let (message, token) = receive_message::<JobQueueMessage>(&bus, JOBS_QUEUE)
        .await
        .unwrap()
        .unwrap();
    controller::process_job_message(&pool, &bus, &jobs, &message).await.unwrap();
    bus.ack(token).await.unwrap();
    let (list_message, token) = receive_message::<TaskQueueMessage>(&bus, TASKS_QUEUE)
        .await
        .unwrap()
        .unwrap();
    worker::process_task_message(&pool, &bus, &jobs, &handlers, &list_message)
        .await
        .unwrap();
    bus.ack(token).await.unwrap();
    let (stage2_message, token) = receive_message::<JobQueueMessage>(&bus, JOBS_QUEUE)
        .await
        .unwrap()
        .unwrap();
    controller::process_job_message(&pool, &bus, &jobs, &stage2_message)
        .await
        .unwrap();
    bus.ack(token).await.unwrap();

    // Both stage-2 tasks finish at the same time on different workers.
    let (m1, t1) = receive_message::<TaskQueueMessage>(&bus, TASKS_QUEUE)
        .await
        .unwrap()
        .unwrap();
    let (m2, t2) = receive_message::<TaskQueueMessage>(&bus, TASKS_QUEUE)
        .await
        .unwrap()
        .unwrap();

    let (pool1, bus1, jobs1) = (pool.clone(), bus.clone(), job_registry());
    let handlers1 = handler_registry();
    let h1 = tokio::spawn(async move {
        worker::process_task_message(&pool1, &bus1, &jobs1, &handlers1, &m1).await
    });
    let (pool2, bus2, jobs2) = (pool.clone(), bus.clone(), job_registry());
    let handlers2 = handler_registry();
    let h2 = tokio::spawn(async move {
        worker::process_task_message(&pool2, &bus2, &jobs2, &handlers2, &m2).await
    });

    h1.await.unwrap().unwrap();
    h2.await.unwrap().unwrap();
    bus.ack(t1).await.unwrap();
    bus.ack(t2).await.unwrap();

    // Exactly one stage-3 message came out of the race.
    let depth = bus.depth(JOBS_QUEUE).await.unwrap();
    assert_eq!(depth.visible, 1, "the advancement must fire exactly once");

    // And the fan-in stage materializes exactly one aggregator task.
    pump_until_quiet(&pool, &bus, &jobs, &handlers).await.unwrap();
    let job = job_db::get_job(&pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let tasks = task_db::list_tasks_for_job(&pool, &job_id).await.unwrap();
    assert_eq!(tasks.iter().filter(|t| t.stage == 3).count(), 1);

    db.finish().await;
}
