//! Database query functions for the `jobs` table.
//!
//! Status changes are conditional UPDATEs gated on the current status, so
//! concurrent workers and the janitor cannot revert a terminal row. The
//! stage-advancement queries take a `&mut PgConnection` because they must
//! run inside the caller's count-and-decide transaction.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};

use crate::models::Job;

/// Insert a job row if no row with this `job_id` exists yet.
///
/// Uses `ON CONFLICT (job_id) DO NOTHING` so resubmission of identical
/// parameters is a no-op. Returns `true` when a new row was inserted.
pub async fn insert_job_if_absent(
    pool: &PgPool,
    job_id: &str,
    job_type: &str,
    parameters: &serde_json::Value,
    total_stages: i32,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO jobs (job_id, job_type, parameters, total_stages) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (job_id) DO NOTHING",
    )
    .bind(job_id)
    .bind(job_type)
    .bind(parameters)
    .bind(total_stages)
    .execute(pool)
    .await
    .context("failed to insert job")?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, job_id: &str) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// List jobs, newest first.
pub async fn list_jobs(pool: &PgPool, limit: i64) -> Result<Vec<Job>> {
    let jobs =
        sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(pool)
            .await
            .context("failed to list jobs")?;

    Ok(jobs)
}

/// Transition a job from `queued` to `processing`.
///
/// Conditional on the current status, so redelivered stage-1 messages
/// cannot re-arm a job that already moved on. Returns rows affected
/// (0 means the job was not in `queued`).
pub async fn mark_job_processing(pool: &PgPool, job_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'processing', updated_at = now() \
         WHERE job_id = $1 AND status = 'queued'",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to mark job processing")?;

    Ok(result.rows_affected())
}

/// Mark a job `failed`, storing the error and optional partial results.
///
/// Only non-terminal jobs are touched. Returns `true` if a row changed.
pub async fn fail_job(
    pool: &PgPool,
    job_id: &str,
    error_details: &str,
    partial_results: Option<&serde_json::Value>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'failed', \
             error_details = $2, \
             result_data = COALESCE($3, result_data), \
             updated_at = now() \
         WHERE job_id = $1 AND status IN ('queued', 'processing')",
    )
    .bind(job_id)
    .bind(error_details)
    .bind(partial_results)
    .execute(pool)
    .await
    .context("failed to fail job")?;

    Ok(result.rows_affected() > 0)
}

/// Touch a job's `updated_at`.
///
/// The janitor uses this to record that it rescued a stuck `queued` job;
/// a second rescue attempt can then tell first offense from repeat.
pub async fn touch_job(pool: &PgPool, job_id: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE jobs SET updated_at = now() WHERE job_id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .context("failed to touch job")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Transaction-scoped queries (stage advancement)
// -----------------------------------------------------------------------

/// Lock the job row for the duration of the caller's transaction.
///
/// `SELECT ... FOR UPDATE` serializes the count-and-decide step across
/// concurrently completing tasks of the same job.
pub async fn lock_job(conn: &mut PgConnection, job_id: &str) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(conn)
        .await
        .context("failed to lock job")?;

    Ok(job)
}

/// Record the completed stage's result snapshot under `stage_results[stage]`.
pub async fn record_stage_results(
    conn: &mut PgConnection,
    job_id: &str,
    stage: i32,
    results: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET stage_results = jsonb_set(stage_results, ARRAY[$2::text], $3, true), \
             updated_at = now() \
         WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(stage.to_string())
    .bind(results)
    .execute(conn)
    .await
    .context("failed to record stage results")?;

    Ok(result.rows_affected())
}

/// Advance the job's stage pointer.
///
/// The `stage < $2` guard keeps the pointer monotonic even if an old
/// advancement message is replayed.
pub async fn advance_stage(conn: &mut PgConnection, job_id: &str, next_stage: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET stage = $2, updated_at = now() \
         WHERE job_id = $1 AND stage < $2 AND status = 'processing'",
    )
    .bind(job_id)
    .bind(next_stage)
    .execute(conn)
    .await
    .context("failed to advance job stage")?;

    Ok(result.rows_affected())
}

/// Mark a job `completed` with its final result payload.
pub async fn complete_job(
    conn: &mut PgConnection,
    job_id: &str,
    result_data: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = 'completed', result_data = $2, updated_at = now() \
         WHERE job_id = $1 AND status = 'processing'",
    )
    .bind(job_id)
    .bind(result_data)
    .execute(conn)
    .await
    .context("failed to complete job")?;

    Ok(result.rows_affected())
}
