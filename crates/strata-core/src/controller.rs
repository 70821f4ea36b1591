//! Job controller: turns a job-queue message into the task rows and task
//! messages of one stage.
//!
//! Every step tolerates redelivery: a replayed stage message re-inserts
//! nothing (`ON CONFLICT DO NOTHING`), re-sends messages only for tasks
//! still `queued`, and exits early when the job has already moved on.

use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use strata_db::models::{JobStatus, StageParallelism};
use strata_db::queries::{jobs as job_db, tasks as task_db};

use crate::bus::{send_message, JobQueueMessage, MessageBus, TaskQueueMessage, TASKS_QUEUE};
use crate::completion::{self, StageDecision};
use crate::ids;
use crate::registry::{JobRegistry, StageTaskResult, TaskSpec};
use crate::results;

/// Process one job-queue message.
///
/// Returns `Ok` when the message should be acked -- including the guard
/// paths where the message is stale or the job is terminal. Errors mean
/// the message should be nacked and redelivered.
pub async fn process_job_message(
    pool: &PgPool,
    bus: &dyn MessageBus,
    registry: &JobRegistry,
    message: &JobQueueMessage,
) -> Result<()> {
    let started = Instant::now();
    let job_id = &message.job_id;
    let stage = message.stage;

    // 1. Load the job. A message without a row is an orphan; nothing to do.
    let Some(job) = job_db::get_job(pool, job_id).await? else {
        warn!(job_id = %job_id, stage, "job message for missing job row, dropping");
        return Ok(());
    };

    // 2. Terminal jobs ignore late messages.
    if job.status.is_terminal() {
        debug!(job_id = %job_id, status = %job.status, "job already terminal, dropping message");
        return Ok(());
    }

    // 3. Stage transition guard: late redelivery after advancement.
    if job.stage > stage {
        debug!(
            job_id = %job_id,
            job_stage = job.stage,
            message_stage = stage,
            "stale stage message, dropping"
        );
        return Ok(());
    }

    // 4. First stage of a fresh job: queued -> processing.
    if job.status == JobStatus::Queued {
        if stage == 1 {
            job_db::mark_job_processing(pool, job_id).await?;
        } else {
            // A queued job can only legally receive its stage-1 message.
            warn!(
                job_id = %job_id,
                stage,
                "stage message for a queued job beyond stage 1, dropping"
            );
            return Ok(());
        }
    }

    let Some(class) = registry.get(&job.job_type) else {
        job_db::fail_job(
            pool,
            job_id,
            &format!("unknown job type: {}", job.job_type),
            None,
        )
        .await?;
        warn!(job_id = %job_id, job_type = %job.job_type, "unknown job type, job failed");
        return Ok(());
    };

    let stages = class.stages();
    let Some(stage_spec) = stages.iter().find(|s| s.number == stage) else {
        job_db::fail_job(
            pool,
            job_id,
            &format!("job type {} declares no stage {stage}", job.job_type),
            None,
        )
        .await?;
        return Ok(());
    };

    // 5. Collect the previous stage's results.
    let previous_results: Vec<StageTaskResult> = if stage > 1 {
        let completed = task_db::completed_stage_tasks(pool, job_id, stage - 1).await?;
        results::project_tasks(&completed)
    } else {
        Vec::new()
    };

    // 6. Task generation.
    let specs: Vec<TaskSpec> = match stage_spec.parallelism {
        StageParallelism::Single | StageParallelism::FanOut => {
            match class.create_tasks_for_stage(stage, &job.parameters, job_id, &previous_results) {
                Ok(specs) => {
                    if stage_spec.parallelism == StageParallelism::Single && specs.len() != 1 {
                        warn!(
                            job_id = %job_id,
                            stage,
                            count = specs.len(),
                            "single-parallelism stage produced an unexpected task count"
                        );
                    }
                    specs
                }
                Err(e) => {
                    job_db::fail_job(pool, job_id, &format!("task generation failed: {e}"), None)
                        .await?;
                    warn!(job_id = %job_id, stage, error = %e, "task generation failed, job failed");
                    return Ok(());
                }
            }
        }
        StageParallelism::FanIn => {
            // The controller owns fan-in: one aggregator task fed every
            // previous-stage result.
            vec![TaskSpec {
                task_id: ids::task_id(job_id, stage, ids::AGGREGATE_UNIT),
                task_type: stage_spec.task_type.clone(),
                parameters: json!({ "previous_results": previous_results }),
            }]
        }
    };

    // 7. Idempotent insertion.
    let new_tasks: Vec<task_db::NewTask> = specs
        .iter()
        .enumerate()
        .map(|(index, spec)| task_db::NewTask {
            task_id: spec.task_id.clone(),
            task_type: spec.task_type.clone(),
            stage,
            task_index: index as i32,
            parameters: spec.parameters.clone(),
        })
        .collect();
    let inserted = task_db::insert_tasks(pool, job_id, &job.job_type, &new_tasks).await?;

    // 8. One task message per row still queued.
    let queued = task_db::queued_stage_tasks(pool, job_id, stage).await?;
    for task in &queued {
        let task_message = TaskQueueMessage {
            task_id: task.task_id.clone(),
            parent_job_id: job_id.clone(),
            task_type: task.task_type.clone(),
            stage,
            parameters: task.parameters.clone(),
            correlation_id: message.correlation_id,
        };
        send_message(bus, TASKS_QUEUE, &task_message).await?;
    }

    info!(
        job_id = %job_id,
        stage,
        generated = specs.len(),
        inserted,
        enqueued = queued.len(),
        latency_ms = started.elapsed().as_millis() as u64,
        event = "stage_dispatched",
        "stage tasks generated and enqueued"
    );

    // 9. Empty stage (zero logical units): nothing will ever settle this
    // stage from the worker side, so run the completion protocol now.
    if inserted == 0 && queued.is_empty() {
        let decision = completion::settle_stage(pool, bus, registry, job_id, stage)
            .await
            .context("failed to settle empty stage")?;
        match &decision {
            StageDecision::Advance { next_stage } => {
                info!(job_id = %job_id, stage, next_stage, "empty stage skipped");
            }
            StageDecision::Finalized => {
                info!(job_id = %job_id, stage, "empty final stage, job finalized");
            }
            StageDecision::NeedsMoreWork | StageDecision::PartialFailure => {
                debug!(job_id = %job_id, stage, decision = ?decision, "empty-stage settle stood down");
            }
        }
    }

    Ok(())
}
