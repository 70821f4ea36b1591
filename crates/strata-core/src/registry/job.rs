//! The `JobClass` trait and registry -- how job types plug into the engine.
//!
//! Each job type registers a class describing its stages, parameter
//! validation, task generation, and final aggregation. The engine never
//! inspects `parameters` or result payloads beyond JSON (de)serialization;
//! their schemas belong to the job class and its handlers.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;

use strata_db::models::StageParallelism;

use crate::error::InvalidParameters;

/// One fixed step of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// 1-based stage number.
    pub number: i32,
    /// Task type every task of this stage carries (handler lookup key).
    pub task_type: String,
    pub parallelism: StageParallelism,
}

/// A task to create, as produced by [`JobClass::create_tasks_for_stage`].
///
/// `task_id` must come from [`crate::ids::task_id`] so predecessor and
/// successor lookups stay derivable.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: String,
    pub task_type: String,
    pub parameters: Value,
}

/// Projection of one completed task handed to the next stage's task
/// generator and to finalization.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StageTaskResult {
    pub task_id: String,
    pub success: bool,
    /// The bare result object the handler returned.
    pub result: Value,
}

/// Everything [`JobClass::finalize`] may aggregate over.
#[derive(Debug, Clone)]
pub struct FinalizeContext {
    pub job_id: String,
    pub parameters: Value,
    /// Per-stage snapshots as persisted on the job row, keyed by stage
    /// number.
    pub stage_results: Value,
    /// Results of the final stage's completed tasks, ordered by task index.
    pub final_stage_results: Vec<StageTaskResult>,
}

/// Contract a job type implements to be orchestrated.
///
/// All methods are pure with respect to the store: they see only the
/// values passed in. Task execution lives in task handlers, not here.
pub trait JobClass: Send + Sync {
    /// Registry key for this job type.
    fn job_type(&self) -> &str;

    /// The fixed, ordered stage list. Stage numbers must be 1..=len.
    fn stages(&self) -> Vec<StageSpec>;

    /// Validate and normalize raw submission parameters.
    ///
    /// The normalized value is what gets hashed into the job ID (minus
    /// control flags) and stored on the job row.
    fn validate_parameters(&self, parameters: &Value) -> Result<Value, InvalidParameters>;

    /// Produce the task specs for a stage.
    ///
    /// - Stage 1 is called with empty `previous_results`.
    /// - Fan-out stages emit one spec per logical unit; zero specs is
    ///   legal and short-circuits the stage.
    /// - Fan-in stages must return an empty list; the controller
    ///   synthesizes the single aggregator task itself.
    fn create_tasks_for_stage(
        &self,
        stage: i32,
        job_parameters: &Value,
        job_id: &str,
        previous_results: &[StageTaskResult],
    ) -> Result<Vec<TaskSpec>>;

    /// Pure aggregation of completed task results into the job's final
    /// `result_data` payload.
    fn finalize(&self, context: &FinalizeContext) -> Result<Value>;
}

// Compile-time assertion: JobClass must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn JobClass) {}
};

/// A collection of registered [`JobClass`] implementations, keyed by
/// job type.
#[derive(Default)]
pub struct JobRegistry {
    classes: HashMap<String, Box<dyn JobClass>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job class under the name returned by
    /// [`JobClass::job_type`].
    ///
    /// The registry is the single source of truth for job declarations:
    /// re-registering a type replaces the previous entry (and returns it)
    /// so a stale declaration cannot shadow the live one.
    pub fn register(&mut self, class: impl JobClass + 'static) -> Option<Box<dyn JobClass>> {
        let name = class.job_type().to_string();
        let previous = self.classes.insert(name.clone(), Box::new(class));
        if previous.is_some() {
            tracing::warn!(job_type = %name, "job type re-registered, replacing previous class");
        }
        previous
    }

    /// Look up a job class by type.
    pub fn get(&self, job_type: &str) -> Option<&dyn JobClass> {
        self.classes.get(job_type).map(|b| b.as_ref())
    }

    /// List the names of all registered job types.
    pub fn list(&self) -> Vec<&str> {
        self.classes.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .finish()
    }
}
