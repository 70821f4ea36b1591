//! Task worker: claims a task message, runs the registered handler, writes
//! the terminal status, and triggers the stage completion protocol.

use std::time::Instant;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use strata_db::queries::tasks as task_db;

use crate::bus::{MessageBus, TaskQueueMessage};
use crate::completion::{self, StageDecision};
use crate::registry::{HandlerRegistry, JobRegistry};
use crate::results;

/// Process one task-queue message.
///
/// Returns `Ok` when the message should be acked (including the duplicate
/// delivery path). Errors mean the message should be nacked and
/// redelivered.
pub async fn process_task_message(
    pool: &PgPool,
    bus: &dyn MessageBus,
    registry: &JobRegistry,
    handlers: &HandlerRegistry,
    message: &TaskQueueMessage,
) -> Result<()> {
    let task_id = &message.task_id;
    let job_id = &message.parent_job_id;

    // 1. CAS entry: queued -> processing. Zero rows means another delivery
    // of this message already claimed (or finished) the task.
    let claimed = task_db::mark_task_processing(pool, task_id).await?;
    if claimed == 0 {
        debug!(
            job_id = %job_id,
            task_id = %task_id,
            stage = message.stage,
            "duplicate task delivery, standing down"
        );
        return Ok(());
    }

    info!(
        job_id = %job_id,
        task_id = %task_id,
        stage = message.stage,
        task_type = %message.task_type,
        correlation_id = %message.correlation_id,
        event = "task_started",
        "task claimed"
    );

    // 2. Handler lookup.
    let started = Instant::now();
    match handlers.get(&message.task_type) {
        None => {
            let error = format!("unknown task_type: {}", message.task_type);
            task_db::fail_task(pool, task_id, &error).await?;
            warn!(job_id = %job_id, task_id = %task_id, %error, "no handler registered");
        }
        Some(handler) => {
            // 3. Execute under the per-handler deadline.
            let outcome =
                tokio::time::timeout(handler.timeout(), handler.run(&message.parameters)).await;

            // 4. Terminal status write. Each write is a CAS from
            // `processing`; if the watchdog failed the task while the
            // handler ran, the late result is dropped.
            match outcome {
                Ok(Ok(result)) => {
                    let envelope = results::success_envelope(result);
                    let updated = task_db::complete_task(pool, task_id, &envelope).await?;
                    if updated == 0 {
                        warn!(
                            job_id = %job_id,
                            task_id = %task_id,
                            "task no longer processing, dropping late result"
                        );
                    } else {
                        info!(
                            job_id = %job_id,
                            task_id = %task_id,
                            stage = message.stage,
                            latency_ms = started.elapsed().as_millis() as u64,
                            event = "task_completed",
                            "handler succeeded"
                        );
                    }
                }
                Ok(Err(e)) => {
                    let error = format!("{e:#}");
                    let updated = task_db::fail_task(pool, task_id, &error).await?;
                    if updated > 0 {
                        warn!(
                            job_id = %job_id,
                            task_id = %task_id,
                            stage = message.stage,
                            latency_ms = started.elapsed().as_millis() as u64,
                            event = "task_failed",
                            error = %error,
                            "handler failed"
                        );
                    }
                }
                Err(_elapsed) => {
                    let error = format!(
                        "handler timed out after {}s",
                        handler.timeout().as_secs()
                    );
                    task_db::fail_task(pool, task_id, &error).await?;
                    warn!(
                        job_id = %job_id,
                        task_id = %task_id,
                        stage = message.stage,
                        event = "task_timeout",
                        "handler exceeded its deadline"
                    );
                }
            }
        }
    }

    // 5. Completion protocol: if this commit settled the stage, advance
    // or finalize the job.
    let decision = completion::settle_stage(pool, bus, registry, job_id, message.stage)
        .await
        .context("stage completion protocol failed")?;

    match &decision {
        StageDecision::NeedsMoreWork => {}
        StageDecision::PartialFailure => {
            debug!(job_id = %job_id, stage = message.stage, "stage settled with failures");
        }
        StageDecision::Advance { next_stage } => {
            debug!(job_id = %job_id, stage = message.stage, next_stage, "last task advanced the job");
        }
        StageDecision::Finalized => {
            debug!(job_id = %job_id, stage = message.stage, "last task finalized the job");
        }
    }

    Ok(())
}
