//! Shared fixtures for the orchestration integration tests: small job
//! classes and handlers that mimic the container-inventory workloads the
//! engine runs in production, minus the object store.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;

use strata_core::bus::{
    receive_message, JobQueueMessage, MessageBus, TaskQueueMessage, JOBS_QUEUE, TASKS_QUEUE,
};
use strata_core::error::InvalidParameters;
use strata_core::ids;
use strata_core::registry::{
    FinalizeContext, HandlerRegistry, JobClass, JobRegistry, StageSpec, StageTaskResult,
    TaskHandler, TaskSpec,
};
use strata_core::{controller, worker};
use strata_db::models::StageParallelism;

// -----------------------------------------------------------------------
// Job classes
// -----------------------------------------------------------------------

/// One stage, one task: the simplest possible job.
pub struct SingletonJob;

impl JobClass for SingletonJob {
    fn job_type(&self) -> &str {
        "echo_singleton"
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![StageSpec {
            number: 1,
            task_type: "echo".into(),
            parallelism: StageParallelism::Single,
        }]
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<Value, InvalidParameters> {
        if !parameters.is_object() {
            return Err(InvalidParameters("parameters must be an object".into()));
        }
        Ok(parameters.clone())
    }

    fn create_tasks_for_stage(
        &self,
        stage: i32,
        job_parameters: &Value,
        job_id: &str,
        _previous_results: &[StageTaskResult],
    ) -> Result<Vec<TaskSpec>> {
        assert_eq!(stage, 1);
        Ok(vec![TaskSpec {
            task_id: ids::task_id(job_id, 1, "echo"),
            task_type: "echo".into(),
            parameters: job_parameters.clone(),
        }])
    }

    fn finalize(&self, context: &FinalizeContext) -> Result<Value> {
        let result = context
            .final_stage_results
            .first()
            .map(|r| r.result.clone())
            .unwrap_or(Value::Null);
        Ok(json!({ "echoed": result }))
    }
}

/// Two stages: list a container, then analyze each blob in parallel.
///
/// The blob names ride in on the submission parameters so the listing
/// handler needs no real object store.
pub struct ContainerListJob;

impl ContainerListJob {
    pub const JOB_TYPE: &str = "list_container_contents";
}

impl JobClass for ContainerListJob {
    fn job_type(&self) -> &str {
        Self::JOB_TYPE
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![
            StageSpec {
                number: 1,
                task_type: "list_container_blobs".into(),
                parallelism: StageParallelism::Single,
            },
            StageSpec {
                number: 2,
                task_type: "analyze_single_blob".into(),
                parallelism: StageParallelism::FanOut,
            },
        ]
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<Value, InvalidParameters> {
        let Some(container) = parameters.get("container_name").and_then(Value::as_str) else {
            return Err(InvalidParameters("container_name is required".into()));
        };
        if container.trim().is_empty() {
            return Err(InvalidParameters(
                "container_name must be a non-empty string".into(),
            ));
        }
        let mut normalized = parameters.clone();
        normalized["container_name"] = json!(container.trim());
        Ok(normalized)
    }

    fn create_tasks_for_stage(
        &self,
        stage: i32,
        job_parameters: &Value,
        job_id: &str,
        previous_results: &[StageTaskResult],
    ) -> Result<Vec<TaskSpec>> {
        match stage {
            1 => Ok(vec![TaskSpec {
                task_id: ids::task_id(job_id, 1, "list"),
                task_type: "list_container_blobs".into(),
                parameters: job_parameters.clone(),
            }]),
            2 => {
                let Some(first) = previous_results.first() else {
                    bail!("stage 2 requires stage 1 results");
                };
                let blob_names = first
                    .result
                    .get("blob_names")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                Ok(blob_names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|blob_name| TaskSpec {
                        task_id: ids::task_id(job_id, 2, blob_name),
                        task_type: "analyze_single_blob".into(),
                        parameters: json!({
                            "container_name": job_parameters["container_name"],
                            "blob_name": blob_name,
                        }),
                    })
                    .collect())
            }
            other => bail!("unexpected stage {other}"),
        }
    }

    fn finalize(&self, context: &FinalizeContext) -> Result<Value> {
        let total_size_mb: f64 = context
            .final_stage_results
            .iter()
            .filter_map(|r| r.result.get("size_mb").and_then(Value::as_f64))
            .sum();
        Ok(json!({
            "container_name": context.parameters["container_name"],
            "analyzed": context.final_stage_results.len(),
            "total_size_mb": total_size_mb,
        }))
    }
}

/// Three stages: list, analyze in parallel, aggregate (fan-in).
pub struct DiamondJob;

impl DiamondJob {
    pub const JOB_TYPE: &str = "list_container_contents_diamond";
}

impl JobClass for DiamondJob {
    fn job_type(&self) -> &str {
        Self::JOB_TYPE
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![
            StageSpec {
                number: 1,
                task_type: "list_container_blobs".into(),
                parallelism: StageParallelism::Single,
            },
            StageSpec {
                number: 2,
                task_type: "analyze_single_blob".into(),
                parallelism: StageParallelism::FanOut,
            },
            StageSpec {
                number: 3,
                task_type: "aggregate_blob_analysis".into(),
                parallelism: StageParallelism::FanIn,
            },
        ]
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<Value, InvalidParameters> {
        ContainerListJob.validate_parameters(parameters)
    }

    fn create_tasks_for_stage(
        &self,
        stage: i32,
        job_parameters: &Value,
        job_id: &str,
        previous_results: &[StageTaskResult],
    ) -> Result<Vec<TaskSpec>> {
        match stage {
            1 | 2 => {
                ContainerListJob.create_tasks_for_stage(stage, job_parameters, job_id, previous_results)
            }
            // Fan-in: the controller synthesizes the aggregator.
            3 => Ok(vec![]),
            other => bail!("unexpected stage {other}"),
        }
    }

    fn finalize(&self, context: &FinalizeContext) -> Result<Value> {
        let aggregate = context
            .final_stage_results
            .first()
            .map(|r| r.result.clone())
            .unwrap_or(Value::Null);
        Ok(json!({
            "container_name": context.parameters["container_name"],
            "summary": aggregate,
        }))
    }
}

// -----------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------

/// Returns its parameters as the result.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn task_type(&self) -> &str {
        "echo"
    }

    async fn run(&self, parameters: &Value) -> Result<Value> {
        Ok(parameters.clone())
    }
}

/// "Lists" the container by echoing the blob names from the parameters.
pub struct ListBlobsHandler;

#[async_trait]
impl TaskHandler for ListBlobsHandler {
    fn task_type(&self) -> &str {
        "list_container_blobs"
    }

    async fn run(&self, parameters: &Value) -> Result<Value> {
        let blob_names = parameters
            .get("blob_names")
            .cloned()
            .unwrap_or_else(|| json!([]));
        Ok(json!({ "blob_names": blob_names }))
    }
}

/// Analyzes one blob. Any blob whose name contains "corrupt" fails.
pub struct AnalyzeBlobHandler;

#[async_trait]
impl TaskHandler for AnalyzeBlobHandler {
    fn task_type(&self) -> &str {
        "analyze_single_blob"
    }

    async fn run(&self, parameters: &Value) -> Result<Value> {
        let blob_name = parameters
            .get("blob_name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if blob_name.contains("corrupt") {
            bail!("unreadable blob: {blob_name}");
        }
        Ok(json!({
            "blob_name": blob_name,
            "size_mb": blob_name.len() as f64,
        }))
    }
}

/// Fan-in aggregator over the previous stage's results.
pub struct AggregateHandler;

#[async_trait]
impl TaskHandler for AggregateHandler {
    fn task_type(&self) -> &str {
        "aggregate_blob_analysis"
    }

    async fn run(&self, parameters: &Value) -> Result<Value> {
        let previous: Vec<StageTaskResult> = serde_json::from_value(
            parameters
                .get("previous_results")
                .cloned()
                .unwrap_or_else(|| json!([])),
        )?;
        let total_size_mb: f64 = previous
            .iter()
            .filter_map(|r| r.result.get("size_mb").and_then(Value::as_f64))
            .sum();
        Ok(json!({
            "total_blobs": previous.len(),
            "total_size_mb": total_size_mb,
        }))
    }
}

// -----------------------------------------------------------------------
// Wiring helpers
// -----------------------------------------------------------------------

/// All fixture job classes in one registry.
pub fn job_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(SingletonJob);
    registry.register(ContainerListJob);
    registry.register(DiamondJob);
    registry
}

/// All fixture handlers in one registry.
pub fn handler_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(EchoHandler);
    registry.register(ListBlobsHandler);
    registry.register(AnalyzeBlobHandler);
    registry.register(AggregateHandler);
    registry
}

/// Drain both queues deterministically: process every visible message
/// (jobs first) until nothing is left. Gives tests a synchronous way to
/// run a whole job to quiescence without the engine loops.
pub async fn pump_until_quiet(
    pool: &PgPool,
    bus: &dyn MessageBus,
    jobs: &JobRegistry,
    handlers: &HandlerRegistry,
) -> Result<()> {
    loop {
        if let Some((message, token)) = receive_message::<JobQueueMessage>(bus, JOBS_QUEUE).await? {
            controller::process_job_message(pool, bus, jobs, &message).await?;
            bus.ack(token).await?;
            continue;
        }

        if let Some((message, token)) =
            receive_message::<TaskQueueMessage>(bus, TASKS_QUEUE).await?
        {
            worker::process_task_message(pool, bus, jobs, handlers, &message).await?;
            bus.ack(token).await?;
            continue;
        }

        return Ok(());
    }
}
