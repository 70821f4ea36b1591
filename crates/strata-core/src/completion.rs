//! Stage completion protocol: "last task turns out the lights".
//!
//! Whoever commits the terminal status that settles a stage must decide
//! what happens next -- advance, finalize, or stand down. The decision
//! runs in one transaction that locks the job row `FOR UPDATE`, so
//! concurrently completing tasks serialize here and exactly one of them
//! observes the settling transition.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use sqlx::PgPool;
use strata_db::queries::{jobs as job_db, tasks as task_db};

use crate::bus::{send_message, JobQueueMessage, MessageBus, JOBS_QUEUE};
use crate::registry::{FinalizeContext, JobRegistry};
use crate::results;

/// Outcome of one count-and-decide transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageDecision {
    /// Tasks of the stage are still queued or processing.
    NeedsMoreWork,
    /// The stage is settled but at least one task failed. The job is left
    /// in `processing`; the janitor's job health monitor escalates it.
    PartialFailure,
    /// All tasks completed and a later stage exists; the job advanced.
    Advance { next_stage: i32 },
    /// All tasks of the final stage completed; the job was finalized.
    Finalized,
}

/// Run the completion protocol for `(job_id, stage)`.
///
/// Safe to call from any vantage point -- the worker that just wrote a
/// terminal status, a controller that generated an empty stage, or the
/// janitor re-triggering a zombie. Every path is status-gated, so
/// duplicate invocations converge on the same state.
///
/// The next-stage message is sent *after* the transaction commits. A
/// crash in between leaves a zombie job (all tasks terminal, job still
/// `processing`) which the janitor repairs by calling this function
/// again.
pub async fn settle_stage(
    pool: &PgPool,
    bus: &dyn MessageBus,
    registry: &JobRegistry,
    job_id: &str,
    stage: i32,
) -> Result<StageDecision> {
    let mut tx = pool.begin().await.context("failed to begin settle transaction")?;

    let Some(job) = job_db::lock_job(&mut tx, job_id).await? else {
        warn!(job_id = %job_id, stage, "settle requested for missing job");
        return Ok(StageDecision::NeedsMoreWork);
    };

    if job.status.is_terminal() {
        debug!(job_id = %job_id, status = %job.status, "settle requested for terminal job");
        return Ok(StageDecision::NeedsMoreWork);
    }

    if job.stage != stage {
        // A late replay for an earlier stage, or a stage the job has not
        // reached. Either way there is nothing to decide here.
        debug!(job_id = %job_id, job_stage = job.stage, stage, "settle stage mismatch");
        return Ok(StageDecision::NeedsMoreWork);
    }

    let counts = task_db::stage_status_counts(&mut tx, job_id, stage).await?;
    if !counts.is_settled() {
        return Ok(StageDecision::NeedsMoreWork);
    }

    if counts.failed > 0 {
        info!(
            job_id = %job_id,
            stage,
            failed = counts.failed,
            completed = counts.completed,
            event = "stage_settled_with_failures",
            "stage settled with failures, leaving job for the janitor"
        );
        return Ok(StageDecision::PartialFailure);
    }

    // Snapshot the stage's results while still holding the job lock.
    let completed = task_db::completed_stage_tasks_tx(&mut tx, job_id, stage).await?;
    let snapshot = results::project_tasks(&completed);
    let snapshot_json =
        serde_json::to_value(&snapshot).context("failed to serialize stage results")?;
    job_db::record_stage_results(&mut tx, job_id, stage, &snapshot_json).await?;

    if stage < job.total_stages {
        let next_stage = stage + 1;
        job_db::advance_stage(&mut tx, job_id, next_stage).await?;
        tx.commit().await.context("failed to commit stage advancement")?;

        info!(
            job_id = %job_id,
            stage,
            next_stage,
            event = "stage_advanced",
            "stage complete, advancing"
        );

        let message =
            JobQueueMessage::for_job(&job.job_id, &job.job_type, next_stage, job.parameters.clone());
        send_message(bus, JOBS_QUEUE, &message).await?;

        return Ok(StageDecision::Advance { next_stage });
    }

    // Final stage: aggregate and complete inside the same transaction.
    let Some(class) = registry.get(&job.job_type) else {
        drop(tx);
        job_db::fail_job(
            pool,
            job_id,
            &format!("unknown job type: {}", job.job_type),
            None,
        )
        .await?;
        anyhow::bail!("cannot finalize job {job_id}: unknown job type {}", job.job_type);
    };

    // Re-read the job's stage_results so finalize sees the snapshot we
    // just recorded for the final stage.
    let mut stage_results = job.stage_results.clone();
    if let serde_json::Value::Object(ref mut map) = stage_results {
        map.insert(stage.to_string(), snapshot_json.clone());
    } else {
        stage_results = json!({ stage.to_string(): snapshot_json });
    }

    let context = FinalizeContext {
        job_id: job.job_id.clone(),
        parameters: job.parameters.clone(),
        stage_results,
        final_stage_results: snapshot,
    };

    match class.finalize(&context) {
        Ok(result_data) => {
            job_db::complete_job(&mut tx, job_id, &result_data).await?;
            tx.commit().await.context("failed to commit job completion")?;
            info!(
                job_id = %job_id,
                stage,
                event = "job_completed",
                "final stage complete, job finalized"
            );
            Ok(StageDecision::Finalized)
        }
        Err(e) => {
            // Finalize is pure, so retrying would fail the same way. Fail
            // the job with the aggregation error instead of looping.
            drop(tx);
            job_db::fail_job(pool, job_id, &format!("finalize failed: {e}"), None).await?;
            Err(e).with_context(|| format!("finalize failed for job {job_id}"))
        }
    }
}
