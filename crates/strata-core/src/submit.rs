//! Submission surface: validate, derive the job identity, create the job
//! row, and enqueue the stage-1 message.

use anyhow::{anyhow, Context};
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;

use strata_db::queries::jobs as job_db;

use crate::bus::{send_message, JobQueueMessage, MessageBus, JOBS_QUEUE};
use crate::error::SubmitError;
use crate::ids;
use crate::registry::JobRegistry;

/// What a caller gets back from [`submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_id: String,
    /// `true` when this call created the job; `false` when an identical
    /// submission already existed and nothing was enqueued.
    pub queued: bool,
}

/// Submit a job.
///
/// Identical parameters always map to the same `job_id`, and resubmission
/// is a no-op: no duplicate job row, no duplicate tasks, no duplicate
/// stage-1 message.
pub async fn submit(
    pool: &PgPool,
    bus: &dyn MessageBus,
    registry: &JobRegistry,
    job_type: &str,
    parameters: &Value,
) -> Result<SubmitReceipt, SubmitError> {
    let class = registry
        .get(job_type)
        .ok_or_else(|| SubmitError::UnknownJobType(job_type.to_owned()))?;

    let normalized = class.validate_parameters(parameters)?;

    let stages = class.stages();
    let total_stages = stages.len() as i32;
    if total_stages == 0 {
        return Err(SubmitError::Internal(anyhow!(
            "job type {job_type} declares no stages"
        )));
    }
    for (i, stage) in stages.iter().enumerate() {
        if stage.number != i as i32 + 1 {
            return Err(SubmitError::Internal(anyhow!(
                "job type {job_type} has non-contiguous stage numbering at position {i}"
            )));
        }
    }

    let job_id = ids::job_id(job_type, &normalized);

    let inserted =
        job_db::insert_job_if_absent(pool, &job_id, job_type, &normalized, total_stages)
            .await
            .context("failed to create job row")?;

    if !inserted {
        info!(job_id = %job_id, job_type, event = "job_resubmitted", "identical job already exists");
        return Ok(SubmitReceipt {
            job_id,
            queued: false,
        });
    }

    let message = JobQueueMessage::initial(&job_id, job_type, normalized);
    send_message(bus, JOBS_QUEUE, &message)
        .await
        .context("failed to enqueue job message")?;

    info!(
        job_id = %job_id,
        job_type,
        total_stages,
        correlation_id = %message.correlation_id,
        event = "job_submitted",
        "job created and enqueued"
    );

    Ok(SubmitReceipt {
        job_id,
        queued: true,
    })
}
