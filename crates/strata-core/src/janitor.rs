//! Janitor: periodic out-of-band reconciliation.
//!
//! Three passes -- task watchdog, job health monitor, orphan & zombie
//! detector -- each wrapped in a `janitor_runs` audit row. Every repair
//! goes through the same status-gated updates as the main path, so the
//! janitor is idempotent and safe to run next to live traffic.

use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use strata_db::models::{JanitorRunStatus, JanitorRunType};
use strata_db::queries::{janitor as janitor_db, jobs as job_db, tasks as task_db};

use crate::bus::{
    job_correlation_id, send_message, JobQueueMessage, MessageBus, TaskQueueMessage, TASKS_QUEUE,
};
use crate::completion::{self, StageDecision};
use crate::registry::JobRegistry;
use crate::results;

/// Timeouts and limits for the janitor passes.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Queued tasks older than this are treated as lost messages.
    pub queued_task_timeout: Duration,
    /// Processing tasks idle longer than this are stale. Must exceed the
    /// longest handler deadline.
    pub processing_task_timeout: Duration,
    /// Queued jobs with zero tasks older than this get their job message
    /// re-sent.
    pub stuck_job_timeout: Duration,
    /// Processing jobs idle longer than this are failed outright.
    pub ancient_job_timeout: Duration,
    /// Requeue budget for orphaned queued tasks.
    pub max_task_retries: i32,
    /// Max items per detection query per pass.
    pub scan_limit: i64,
    /// Whether the orphan detector deletes orphaned task rows or only
    /// logs them.
    pub delete_orphan_tasks: bool,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            queued_task_timeout: Duration::from_secs(10 * 60),
            processing_task_timeout: Duration::from_secs(30 * 60),
            stuck_job_timeout: Duration::from_secs(60 * 60),
            ancient_job_timeout: Duration::from_secs(24 * 60 * 60),
            max_task_retries: 3,
            scan_limit: 50,
            delete_orphan_tasks: false,
        }
    }
}

/// Summary of one audited janitor pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub run_id: Uuid,
    pub run_type: JanitorRunType,
    pub items_scanned: i32,
    pub items_fixed: i32,
    pub actions: Vec<Value>,
}

/// Run all three passes in order and return their reports.
pub async fn run_all(
    pool: &PgPool,
    bus: &dyn MessageBus,
    registry: &JobRegistry,
    config: &JanitorConfig,
) -> Result<Vec<PassReport>> {
    let mut reports = Vec::with_capacity(3);
    reports.push(run_task_watchdog(pool, bus, config).await?);
    reports.push(run_job_health(pool, config).await?);
    reports.push(run_orphan_detector(pool, bus, registry, config).await?);
    Ok(reports)
}

/// Open an audit row, run the pass body, close the row either way.
async fn audited<F>(
    pool: &PgPool,
    run_type: JanitorRunType,
    body: F,
) -> Result<PassReport>
where
    F: std::future::Future<Output = Result<(i32, Vec<Value>)>>,
{
    let run = janitor_db::insert_run(pool, run_type).await?;

    match body.await {
        Ok((items_scanned, actions)) => {
            let items_fixed = actions.len() as i32;
            let actions_json = Value::Array(actions.clone());
            janitor_db::finish_run(
                pool,
                run.run_id,
                JanitorRunStatus::Completed,
                items_scanned,
                items_fixed,
                &actions_json,
                None,
            )
            .await?;

            info!(
                run_id = %run.run_id,
                run_type = %run_type,
                items_scanned,
                items_fixed,
                "janitor pass completed"
            );

            Ok(PassReport {
                run_id: run.run_id,
                run_type,
                items_scanned,
                items_fixed,
                actions,
            })
        }
        Err(e) => {
            let _ = janitor_db::finish_run(
                pool,
                run.run_id,
                JanitorRunStatus::Failed,
                0,
                0,
                &json!([]),
                Some(&format!("{e:#}")),
            )
            .await;
            Err(e)
        }
    }
}

// -----------------------------------------------------------------------
// Task watchdog
// -----------------------------------------------------------------------

/// Requeue lost task messages and fail stale processing tasks.
pub async fn run_task_watchdog(
    pool: &PgPool,
    bus: &dyn MessageBus,
    config: &JanitorConfig,
) -> Result<PassReport> {
    audited(pool, JanitorRunType::TaskWatchdog, async {
        let mut actions = Vec::new();

        let orphaned = janitor_db::orphaned_queued_tasks(
            pool,
            config.queued_task_timeout.as_secs() as i64,
            config.scan_limit,
        )
        .await?;

        for task in &orphaned {
            if task.retry_count >= config.max_task_retries {
                let updated = task_db::fail_queued_task(
                    pool,
                    &task.task_id,
                    "orphaned queued: retry budget exhausted",
                )
                .await?;
                if updated > 0 {
                    warn!(
                        job_id = %task.parent_job_id,
                        task_id = %task.task_id,
                        retry_count = task.retry_count,
                        "orphaned queued task out of retries, failed"
                    );
                    actions.push(json!({
                        "action": "fail_orphaned_queued",
                        "task_id": task.task_id,
                        "job_id": task.parent_job_id,
                        "retry_count": task.retry_count,
                    }));
                }
            } else {
                // Bump first: if a worker claims the task between the
                // detection query and here, the CAS misses and no
                // duplicate message is sent.
                let updated = janitor_db::bump_task_retry(pool, &task.task_id).await?;
                if updated > 0 {
                    let message = TaskQueueMessage {
                        task_id: task.task_id.clone(),
                        parent_job_id: task.parent_job_id.clone(),
                        task_type: task.task_type.clone(),
                        stage: task.stage,
                        parameters: task.parameters.clone(),
                        correlation_id: job_correlation_id(&task.parent_job_id),
                    };
                    send_message(bus, TASKS_QUEUE, &message).await?;
                    info!(
                        job_id = %task.parent_job_id,
                        task_id = %task.task_id,
                        retry_count = task.retry_count + 1,
                        "re-emitted lost task message"
                    );
                    actions.push(json!({
                        "action": "requeue_task",
                        "task_id": task.task_id,
                        "job_id": task.parent_job_id,
                        "retry_count": task.retry_count + 1,
                    }));
                }
            }
        }

        let stale = janitor_db::stale_processing_tasks(
            pool,
            config.processing_task_timeout.as_secs() as i64,
            config.scan_limit,
        )
        .await?;

        if !stale.is_empty() {
            let ids: Vec<String> = stale.iter().map(|t| t.task_id.clone()).collect();
            let failed = janitor_db::mark_tasks_failed(pool, &ids, "stale processing").await?;
            if failed > 0 {
                warn!(count = failed, "failed stale processing tasks");
                for task in &stale {
                    actions.push(json!({
                        "action": "fail_stale_processing",
                        "task_id": task.task_id,
                        "job_id": task.parent_job_id,
                    }));
                }
            }
        }

        Ok(((orphaned.len() + stale.len()) as i32, actions))
    })
    .await
}

// -----------------------------------------------------------------------
// Job health monitor
// -----------------------------------------------------------------------

/// Fail-fast escalation: a processing job with any permanently failed
/// task is failed, preserving partial results from its completed tasks.
pub async fn run_job_health(pool: &PgPool, config: &JanitorConfig) -> Result<PassReport> {
    audited(pool, JanitorRunType::JobHealth, async {
        let mut actions = Vec::new();

        let unhealthy = janitor_db::jobs_with_failed_tasks(pool, config.scan_limit).await?;

        for job in &unhealthy {
            let completed = janitor_db::completed_task_results(pool, &job.job_id).await?;
            let partial: Vec<Value> = completed
                .iter()
                .map(|t| {
                    json!({
                        "task_id": t.task_id,
                        "stage": t.stage,
                        "result": results::envelope_result(t.result_data.as_ref()),
                    })
                })
                .collect();
            let partial_payload = json!({ "partial_results": partial });

            let error = job
                .first_error
                .clone()
                .unwrap_or_else(|| "task failed".to_owned());

            if job_db::fail_job(pool, &job.job_id, &error, Some(&partial_payload)).await? {
                warn!(
                    job_id = %job.job_id,
                    stage = job.stage,
                    failed_tasks = job.failed_count,
                    completed_tasks = job.completed_count,
                    event = "job_failed",
                    "job failed after task failure"
                );
                actions.push(json!({
                    "action": "fail_job",
                    "job_id": job.job_id,
                    "stage": job.stage,
                    "failed_tasks": job.failed_count,
                    "partial_results": partial.len(),
                }));
            }
        }

        Ok((unhealthy.len() as i32, actions))
    })
    .await
}

// -----------------------------------------------------------------------
// Orphan & zombie detector
// -----------------------------------------------------------------------

/// Reconcile structural anomalies: tasks without jobs, jobs whose
/// advancement never fired, lost initial job messages, and jobs stuck in
/// processing for longer than any sane run.
pub async fn run_orphan_detector(
    pool: &PgPool,
    bus: &dyn MessageBus,
    registry: &JobRegistry,
    config: &JanitorConfig,
) -> Result<PassReport> {
    audited(pool, JanitorRunType::OrphanDetector, async {
        let mut actions = Vec::new();
        let mut scanned = 0i32;

        // Orphan tasks: no parent job row.
        let orphans = janitor_db::orphaned_tasks(pool, config.scan_limit).await?;
        scanned += orphans.len() as i32;
        for task in &orphans {
            warn!(
                task_id = %task.task_id,
                job_id = %task.parent_job_id,
                "orphaned task: parent job row missing"
            );
        }
        if config.delete_orphan_tasks && !orphans.is_empty() {
            let ids: Vec<String> = orphans.iter().map(|t| t.task_id.clone()).collect();
            let deleted = janitor_db::delete_tasks(pool, &ids).await?;
            if deleted > 0 {
                actions.push(json!({
                    "action": "delete_orphaned_tasks",
                    "task_ids": ids,
                }));
            }
        }

        // Zombie jobs: processing, every task terminal, nothing in flight.
        let zombies = janitor_db::zombie_jobs(pool, config.scan_limit).await?;
        scanned += zombies.len() as i32;
        for job in &zombies {
            // Two zombie shapes: the current stage has tasks (advancement
            // never decided) or it has none (advancement committed but the
            // next stage message was lost). The first re-runs the
            // completion protocol; the second re-sends the stage message.
            let mut conn = pool.acquire().await?;
            let counts =
                task_db::stage_status_counts(&mut conn, &job.job_id, job.stage).await?;
            drop(conn);

            if counts.total == 0 {
                let message = JobQueueMessage::for_job(
                    &job.job_id,
                    &job.job_type,
                    job.stage,
                    job.parameters.clone(),
                );
                send_message(bus, crate::bus::JOBS_QUEUE, &message).await?;
                info!(
                    job_id = %job.job_id,
                    stage = job.stage,
                    "zombie job: re-sent lost stage message"
                );
                actions.push(json!({
                    "action": "reenqueue_stage",
                    "job_id": job.job_id,
                    "stage": job.stage,
                }));
                continue;
            }

            match completion::settle_stage(pool, bus, registry, &job.job_id, job.stage).await {
                Ok(StageDecision::Advance { next_stage }) => {
                    info!(
                        job_id = %job.job_id,
                        stage = job.stage,
                        next_stage,
                        "zombie job revived: advancement re-triggered"
                    );
                    actions.push(json!({
                        "action": "retrigger_advancement",
                        "job_id": job.job_id,
                        "stage": job.stage,
                        "next_stage": next_stage,
                    }));
                }
                Ok(StageDecision::Finalized) => {
                    info!(job_id = %job.job_id, "zombie job revived: finalized");
                    actions.push(json!({
                        "action": "retrigger_finalize",
                        "job_id": job.job_id,
                    }));
                }
                // Failures belong to the job health monitor; fresh
                // activity means the job was never really a zombie.
                Ok(StageDecision::PartialFailure | StageDecision::NeedsMoreWork) => {}
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "zombie re-trigger failed");
                    if job_db::fail_job(
                        pool,
                        &job.job_id,
                        &format!("zombie job: stage advancement failed: {e}"),
                        None,
                    )
                    .await?
                    {
                        actions.push(json!({
                            "action": "fail_zombie_job",
                            "job_id": job.job_id,
                        }));
                    }
                }
            }
        }

        // Stuck queued jobs: initial job message lost before any task
        // existed.
        let stuck = janitor_db::stuck_queued_jobs(
            pool,
            config.stuck_job_timeout.as_secs() as i64,
            config.scan_limit,
        )
        .await?;
        scanned += stuck.len() as i32;
        for job in &stuck {
            // A previous rescue touched updated_at; a repeat offender gets
            // failed instead of looping forever.
            let rescued_before =
                job.updated_at > job.created_at + chrono::Duration::seconds(60);
            if rescued_before {
                if job_db::fail_job(
                    pool,
                    &job.job_id,
                    "stuck queued: job message lost repeatedly",
                    None,
                )
                .await?
                {
                    warn!(job_id = %job.job_id, "stuck queued job failed after repeat rescue");
                    actions.push(json!({
                        "action": "fail_stuck_queued",
                        "job_id": job.job_id,
                    }));
                }
            } else {
                job_db::touch_job(pool, &job.job_id).await?;
                let mut message = JobQueueMessage::for_job(
                    &job.job_id,
                    &job.job_type,
                    1,
                    job.parameters.clone(),
                );
                message.attempt = 2;
                send_message(bus, crate::bus::JOBS_QUEUE, &message).await?;
                info!(job_id = %job.job_id, "re-enqueued stuck queued job");
                actions.push(json!({
                    "action": "reenqueue_job",
                    "job_id": job.job_id,
                }));
            }
        }

        // Ancient processing jobs.
        let ancient = janitor_db::ancient_processing_jobs(
            pool,
            config.ancient_job_timeout.as_secs() as i64,
            config.scan_limit,
        )
        .await?;
        scanned += ancient.len() as i32;
        for job in &ancient {
            let hours = config.ancient_job_timeout.as_secs() / 3600;
            if job_db::fail_job(
                pool,
                &job.job_id,
                &format!("ancient processing job: idle beyond {hours}h"),
                None,
            )
            .await?
            {
                warn!(job_id = %job.job_id, "ancient processing job failed");
                actions.push(json!({
                    "action": "fail_ancient_job",
                    "job_id": job.job_id,
                }));
            }
        }

        Ok((scanned, actions))
    })
    .await
}
