//! Maintenance queries for the janitor subsystem.
//!
//! Detection queries for lost messages, stuck states, orphans, and
//! zombies, plus the `janitor_runs` audit trail. All repair UPDATEs are
//! gated on the current status so they stay idempotent and safe to run
//! concurrently with live controller/worker traffic.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{JanitorRun, JanitorRunStatus, JanitorRunType, Job, Task};

// -----------------------------------------------------------------------
// Task watchdog
// -----------------------------------------------------------------------

/// Tasks sitting in `queued` longer than the timeout.
///
/// These are task messages the broker lost: the row exists but no worker
/// ever claimed it. Ordered oldest-first and capped so one pass does a
/// bounded amount of repair work.
pub async fn orphaned_queued_tasks(
    pool: &PgPool,
    timeout_secs: i64,
    limit: i64,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'queued' \
           AND created_at < now() - make_interval(secs => $1) \
         ORDER BY created_at ASC \
         LIMIT $2",
    )
    .bind(timeout_secs as f64)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to find orphaned queued tasks")?;

    Ok(tasks)
}

/// Tasks stuck in `processing` beyond the worker's maximum runtime.
pub async fn stale_processing_tasks(
    pool: &PgPool,
    timeout_secs: i64,
    limit: i64,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'processing' \
           AND updated_at < now() - make_interval(secs => $1) \
         ORDER BY updated_at ASC \
         LIMIT $2",
    )
    .bind(timeout_secs as f64)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to find stale processing tasks")?;

    Ok(tasks)
}

/// Bump the retry counter of a still-`queued` task before its message is
/// re-emitted. Returns rows affected (0 means a worker claimed it in the
/// meantime and no requeue is needed).
pub async fn bump_task_retry(pool: &PgPool, task_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET retry_count = retry_count + 1, updated_at = now() \
         WHERE task_id = $1 AND status = 'queued'",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to bump task retry count")?;

    Ok(result.rows_affected())
}

/// Batch mark non-terminal tasks as `failed`.
pub async fn mark_tasks_failed(
    pool: &PgPool,
    task_ids: &[String],
    error_details: &str,
) -> Result<u64> {
    if task_ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', error_details = $2, updated_at = now() \
         WHERE task_id = ANY($1) AND status IN ('queued', 'processing')",
    )
    .bind(task_ids)
    .bind(error_details)
    .execute(pool)
    .await
    .context("failed to batch-fail tasks")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Job health monitor
// -----------------------------------------------------------------------

/// A `processing` job together with its per-status task counts and the
/// error of its first failed task.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UnhealthyJob {
    pub job_id: String,
    pub job_type: String,
    pub stage: i32,
    pub total_stages: i32,
    pub failed_count: i64,
    pub completed_count: i64,
    pub first_error: Option<String>,
}

/// Jobs in `processing` that have at least one `failed` task.
pub async fn jobs_with_failed_tasks(pool: &PgPool, limit: i64) -> Result<Vec<UnhealthyJob>> {
    let jobs = sqlx::query_as::<_, UnhealthyJob>(
        "SELECT \
             j.job_id, \
             j.job_type, \
             j.stage, \
             j.total_stages, \
             COUNT(t.*) FILTER (WHERE t.status = 'failed') AS failed_count, \
             COUNT(t.*) FILTER (WHERE t.status = 'completed') AS completed_count, \
             (ARRAY_AGG(t.error_details ORDER BY t.updated_at) \
                  FILTER (WHERE t.status = 'failed'))[1] AS first_error \
         FROM jobs j \
         JOIN tasks t ON t.parent_job_id = j.job_id \
         WHERE j.status = 'processing' \
         GROUP BY j.job_id \
         HAVING COUNT(t.*) FILTER (WHERE t.status = 'failed') > 0 \
         ORDER BY j.updated_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to find jobs with failed tasks")?;

    Ok(jobs)
}

/// Results of all completed tasks for a job, across every stage.
///
/// Feeds the partial-results payload persisted when the job health
/// monitor fails a job.
pub async fn completed_task_results(pool: &PgPool, job_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE parent_job_id = $1 AND status = 'completed' \
         ORDER BY stage, task_index",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch completed task results")?;

    Ok(tasks)
}

// -----------------------------------------------------------------------
// Orphan & zombie detection
// -----------------------------------------------------------------------

/// Tasks whose parent job row no longer exists.
pub async fn orphaned_tasks(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         LEFT JOIN jobs j ON j.job_id = t.parent_job_id \
         WHERE j.job_id IS NULL \
         ORDER BY t.created_at DESC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to find orphaned tasks")?;

    Ok(tasks)
}

/// Delete orphaned task rows by ID.
pub async fn delete_tasks(pool: &PgPool, task_ids: &[String]) -> Result<u64> {
    if task_ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query("DELETE FROM tasks WHERE task_id = ANY($1)")
        .bind(task_ids)
        .execute(pool)
        .await
        .context("failed to delete orphaned tasks")?;

    Ok(result.rows_affected())
}

/// Zombie jobs: `processing`, at least one task, and every task terminal.
///
/// This is the signature of a stage advancement that never fired -- the
/// last worker committed its terminal status but died before enqueueing
/// the next stage message (or finalizing).
pub async fn zombie_jobs(pool: &PgPool, limit: i64) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT j.* FROM jobs j \
         WHERE j.status = 'processing' \
           AND EXISTS ( \
               SELECT 1 FROM tasks t WHERE t.parent_job_id = j.job_id \
           ) \
           AND NOT EXISTS ( \
               SELECT 1 FROM tasks t \
               WHERE t.parent_job_id = j.job_id \
                 AND t.status IN ('queued', 'processing') \
           ) \
         ORDER BY j.updated_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to find zombie jobs")?;

    Ok(jobs)
}

/// Jobs stuck in `queued` with zero tasks beyond the timeout.
///
/// The initial job message was lost before the controller ever created
/// stage-1 tasks.
pub async fn stuck_queued_jobs(pool: &PgPool, timeout_secs: i64, limit: i64) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT j.* FROM jobs j \
         WHERE j.status = 'queued' \
           AND j.created_at < now() - make_interval(secs => $1) \
           AND NOT EXISTS ( \
               SELECT 1 FROM tasks t WHERE t.parent_job_id = j.job_id \
           ) \
         ORDER BY j.created_at ASC \
         LIMIT $2",
    )
    .bind(timeout_secs as f64)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to find stuck queued jobs")?;

    Ok(jobs)
}

/// Jobs in `processing` whose last update is older than the cutoff.
pub async fn ancient_processing_jobs(
    pool: &PgPool,
    timeout_secs: i64,
    limit: i64,
) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT j.* FROM jobs j \
         WHERE j.status = 'processing' \
           AND j.updated_at < now() - make_interval(secs => $1) \
         ORDER BY j.updated_at ASC \
         LIMIT $2",
    )
    .bind(timeout_secs as f64)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to find ancient processing jobs")?;

    Ok(jobs)
}

// -----------------------------------------------------------------------
// Audit trail
// -----------------------------------------------------------------------

/// Open a `janitor_runs` audit row in `running` state.
pub async fn insert_run(pool: &PgPool, run_type: JanitorRunType) -> Result<JanitorRun> {
    let run = sqlx::query_as::<_, JanitorRun>(
        "INSERT INTO janitor_runs (run_type) VALUES ($1) RETURNING *",
    )
    .bind(run_type)
    .fetch_one(pool)
    .await
    .context("failed to insert janitor run")?;

    Ok(run)
}

/// Close an audit row with final counters and actions.
pub async fn finish_run(
    pool: &PgPool,
    run_id: Uuid,
    status: JanitorRunStatus,
    items_scanned: i32,
    items_fixed: i32,
    actions_taken: &serde_json::Value,
    error_details: Option<&str>,
) -> Result<bool> {
    let completed_at: DateTime<Utc> = Utc::now();
    let result = sqlx::query(
        "UPDATE janitor_runs \
         SET completed_at = $2, \
             status = $3, \
             items_scanned = $4, \
             items_fixed = $5, \
             actions_taken = $6, \
             error_details = $7, \
             duration_ms = (EXTRACT(EPOCH FROM ($2 - started_at)) * 1000)::bigint \
         WHERE run_id = $1",
    )
    .bind(run_id)
    .bind(completed_at)
    .bind(status)
    .bind(items_scanned)
    .bind(items_fixed)
    .bind(actions_taken)
    .bind(error_details)
    .execute(pool)
    .await
    .context("failed to finish janitor run")?;

    Ok(result.rows_affected() > 0)
}

/// Recent janitor runs for monitoring, newest first.
pub async fn recent_runs(
    pool: &PgPool,
    hours: i64,
    run_type: Option<JanitorRunType>,
    limit: i64,
) -> Result<Vec<JanitorRun>> {
    let runs = sqlx::query_as::<_, JanitorRun>(
        "SELECT * FROM janitor_runs \
         WHERE started_at > now() - make_interval(hours => $1) \
           AND ($2::text IS NULL OR run_type = $2) \
         ORDER BY started_at DESC \
         LIMIT $3",
    )
    .bind(hours as i32)
    .bind(run_type.map(|t| t.to_string()))
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch recent janitor runs")?;

    Ok(runs)
}
