//! Engine runtime: the application context plus the consumer loops.
//!
//! One `Engine` owns the pool, the bus, and both registries, and drives
//! three loops: a job-controller consumer, a single task consumer whose
//! executions are bounded by a semaphore, and the janitor ticker.
//! Deployments run any number of engine processes; all coordination
//! happens through the store and the bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{
    receive_message, JobQueueMessage, MessageBus, TaskQueueMessage, JOBS_QUEUE, TASKS_QUEUE,
};
use crate::controller;
use crate::janitor::{self, JanitorConfig};
use crate::registry::{HandlerRegistry, JobRegistry};
use crate::worker;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of handler executions allowed in flight in this process.
    pub worker_concurrency: usize,
    /// Sleep between polls when a queue is empty.
    pub poll_interval: Duration,
    /// How often the janitor runs.
    pub janitor_interval: Duration,
    pub janitor: JanitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            poll_interval: Duration::from_millis(500),
            janitor_interval: Duration::from_secs(5 * 60),
            janitor: JanitorConfig::default(),
        }
    }
}

/// The application context threaded through every component.
pub struct Engine {
    pool: PgPool,
    bus: Arc<dyn MessageBus>,
    jobs: Arc<JobRegistry>,
    handlers: Arc<HandlerRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        pool: PgPool,
        bus: Arc<dyn MessageBus>,
        jobs: Arc<JobRegistry>,
        handlers: Arc<HandlerRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            bus,
            jobs,
            handlers,
            config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn job_registry(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Run the engine until the token is cancelled.
    ///
    /// Spawns the job-controller loop, the semaphore-bounded task
    /// consumer, and the janitor ticker, then waits for all of them to
    /// drain.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(
            workers = self.config.worker_concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            janitor_interval_s = self.config.janitor_interval.as_secs(),
            "engine starting"
        );

        let mut handles = Vec::new();

        {
            let engine = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { engine.job_loop(cancel).await }));
        }

        {
            let engine = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { engine.task_loop(cancel).await }));
        }

        {
            let engine = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { engine.janitor_loop(cancel).await }));
        }

        for handle in handles {
            handle.await.context("engine loop panicked")?;
        }

        info!("engine stopped");
        Ok(())
    }

    /// Consume the jobs queue until cancelled.
    async fn job_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let received = receive_message::<JobQueueMessage>(self.bus.as_ref(), JOBS_QUEUE).await;
            match received {
                Ok(Some((message, token))) => {
                    match controller::process_job_message(
                        &self.pool,
                        self.bus.as_ref(),
                        &self.jobs,
                        &message,
                    )
                    .await
                    {
                        Ok(()) => {
                            if let Err(e) = self.bus.ack(token).await {
                                error!(error = %e, "failed to ack job message");
                            }
                        }
                        Err(e) => {
                            warn!(
                                job_id = %message.job_id,
                                stage = message.stage,
                                error = %e,
                                "job message processing failed, nacking for redelivery"
                            );
                            if let Err(e) = self.bus.nack(token).await {
                                error!(error = %e, "failed to nack job message");
                            }
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    // Poison messages are already acked inside receive;
                    // transient broker errors just back off.
                    warn!(error = %e, "job queue receive failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    /// Consume the tasks queue until cancelled.
    ///
    /// One receive loop; each delivery runs in its own spawned task
    /// holding a semaphore permit, so at most `worker_concurrency`
    /// handlers execute at once. The permit is taken *before* receiving:
    /// a message is never claimed (and its visibility clock started)
    /// while every worker slot is busy.
    async fn task_loop(&self, cancel: CancellationToken) {
        let concurrency = self.config.worker_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("task semaphore closed")
                }
                _ = cancel.cancelled() => break,
            };

            let received =
                receive_message::<TaskQueueMessage>(self.bus.as_ref(), TASKS_QUEUE).await;
            match received {
                Ok(Some((message, token))) => {
                    let pool = self.pool.clone();
                    let bus = Arc::clone(&self.bus);
                    let jobs = Arc::clone(&self.jobs);
                    let handlers = Arc::clone(&self.handlers);

                    tokio::spawn(async move {
                        let outcome = worker::process_task_message(
                            &pool,
                            bus.as_ref(),
                            &jobs,
                            &handlers,
                            &message,
                        )
                        .await;

                        match outcome {
                            Ok(()) => {
                                if let Err(e) = bus.ack(token).await {
                                    error!(error = %e, "failed to ack task message");
                                }
                            }
                            Err(e) => {
                                warn!(
                                    task_id = %message.task_id,
                                    job_id = %message.parent_job_id,
                                    error = %e,
                                    "task message processing failed, nacking for redelivery"
                                );
                                if let Err(e) = bus.nack(token).await {
                                    error!(error = %e, "failed to nack task message");
                                }
                            }
                        }

                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "task queue receive failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        // Drain: wait until every in-flight handler returns its permit.
        let _ = semaphore.acquire_many(concurrency as u32).await;
    }

    /// Run the janitor on a fixed interval until cancelled.
    async fn janitor_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.janitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fleet restart
        // does not stampede the janitor.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = janitor::run_all(
                        &self.pool,
                        self.bus.as_ref(),
                        &self.jobs,
                        &self.config.janitor,
                    )
                    .await
                    {
                        error!(error = %e, "janitor pass failed");
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}
