//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};

use crate::models::{Task, TaskStatus};

/// A task row to insert, as produced by a job class (or synthesized by the
/// controller for fan-in stages).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub task_type: String,
    pub stage: i32,
    pub task_index: i32,
    pub parameters: serde_json::Value,
}

/// Insert task rows idempotently.
///
/// `ON CONFLICT (task_id) DO NOTHING` is the recovery knob for controller
/// message redelivery: replaying a stage message re-inserts nothing and
/// leaves in-flight rows untouched. Returns the number of rows actually
/// inserted.
pub async fn insert_tasks(
    pool: &PgPool,
    parent_job_id: &str,
    job_type: &str,
    tasks: &[NewTask],
) -> Result<u64> {
    let mut inserted = 0;
    for task in tasks {
        let result = sqlx::query(
            "INSERT INTO tasks (task_id, parent_job_id, job_type, task_type, stage, task_index, parameters) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (task_id) DO NOTHING",
        )
        .bind(&task.task_id)
        .bind(parent_job_id)
        .bind(job_type)
        .bind(&task.task_type)
        .bind(task.stage)
        .bind(task.task_index)
        .bind(&task.parameters)
        .execute(pool)
        .await
        .with_context(|| format!("failed to insert task {}", task.task_id))?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, task_id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a job, ordered by stage then task index.
pub async fn list_tasks_for_job(pool: &PgPool, parent_job_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE parent_job_id = $1 ORDER BY stage, task_index",
    )
    .bind(parent_job_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for job")?;

    Ok(tasks)
}

/// List the tasks of one stage that are still `queued`.
///
/// The controller enqueues one task message per row returned here, so a
/// redelivered stage message only re-sends messages for work that has not
/// been picked up yet.
pub async fn queued_stage_tasks(
    pool: &PgPool,
    parent_job_id: &str,
    stage: i32,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE parent_job_id = $1 AND stage = $2 AND status = 'queued' \
         ORDER BY task_index",
    )
    .bind(parent_job_id)
    .bind(stage)
    .fetch_all(pool)
    .await
    .context("failed to list queued stage tasks")?;

    Ok(tasks)
}

/// CAS transition `queued -> processing`.
///
/// This is the worker's duplicate-delivery guard: rows_affected == 0 means
/// another delivery of the same message already claimed (or finished) the
/// task, and the caller must ack and exit.
pub async fn mark_task_processing(pool: &PgPool, task_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'processing', updated_at = now() \
         WHERE task_id = $1 AND status = 'queued'",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to mark task processing")?;

    Ok(result.rows_affected())
}

/// CAS transition `processing -> completed`, storing the result envelope.
pub async fn complete_task(
    pool: &PgPool,
    task_id: &str,
    result_data: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', result_data = $2, updated_at = now() \
         WHERE task_id = $1 AND status = 'processing'",
    )
    .bind(task_id)
    .bind(result_data)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// CAS transition `processing -> failed`, storing the error.
pub async fn fail_task(pool: &PgPool, task_id: &str, error_details: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', error_details = $2, updated_at = now() \
         WHERE task_id = $1 AND status = 'processing'",
    )
    .bind(task_id)
    .bind(error_details)
    .execute(pool)
    .await
    .context("failed to fail task")?;

    Ok(result.rows_affected())
}

/// Mark a `queued` task `failed` without it ever having been claimed.
///
/// Used by the janitor when a lost task message has exhausted its
/// requeue budget.
pub async fn fail_queued_task(pool: &PgPool, task_id: &str, error_details: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', error_details = $2, updated_at = now() \
         WHERE task_id = $1 AND status = 'queued'",
    )
    .bind(task_id)
    .bind(error_details)
    .execute(pool)
    .await
    .context("failed to fail queued task")?;

    Ok(result.rows_affected())
}

/// Completed tasks of a stage, ordered by task index.
///
/// Feeds the controller's previous-results projection and job finalization.
pub async fn completed_stage_tasks(
    pool: &PgPool,
    parent_job_id: &str,
    stage: i32,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE parent_job_id = $1 AND stage = $2 AND status = 'completed' \
         ORDER BY task_index",
    )
    .bind(parent_job_id)
    .bind(stage)
    .fetch_all(pool)
    .await
    .context("failed to list completed stage tasks")?;

    Ok(tasks)
}

// -----------------------------------------------------------------------
// Stage status counts
// -----------------------------------------------------------------------

/// Status counts for the tasks of one `(job, stage)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

impl StageCounts {
    /// No task of the stage can still make progress.
    pub fn is_settled(&self) -> bool {
        self.queued + self.processing == 0
    }
}

/// Count the stage's tasks by status inside the caller's transaction.
///
/// Must run after [`super::jobs::lock_job`] so that concurrently finishing
/// tasks serialize on the job row and exactly one of them observes the
/// stage as settled first.
pub async fn stage_status_counts(
    conn: &mut PgConnection,
    parent_job_id: &str,
    stage: i32,
) -> Result<StageCounts> {
    let rows: Vec<(TaskStatus, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) \
         FROM tasks \
         WHERE parent_job_id = $1 AND stage = $2 \
         GROUP BY status",
    )
    .bind(parent_job_id)
    .bind(stage)
    .fetch_all(conn)
    .await
    .context("failed to count stage tasks")?;

    let mut counts = StageCounts::default();
    for (status, count) in &rows {
        match status {
            TaskStatus::Queued => counts.queued = *count,
            TaskStatus::Processing => counts.processing = *count,
            TaskStatus::Completed => counts.completed = *count,
            TaskStatus::Failed => counts.failed = *count,
        }
        counts.total += count;
    }
    Ok(counts)
}

/// Completed tasks of a stage, transaction-scoped variant.
///
/// The advancement protocol snapshots stage results while still holding
/// the job row lock.
pub async fn completed_stage_tasks_tx(
    conn: &mut PgConnection,
    parent_job_id: &str,
    stage: i32,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE parent_job_id = $1 AND stage = $2 AND status = 'completed' \
         ORDER BY task_index",
    )
    .bind(parent_job_id)
    .bind(stage)
    .fetch_all(conn)
    .await
    .context("failed to list completed stage tasks")?;

    Ok(tasks)
}
