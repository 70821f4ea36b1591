//! The stored result envelope and its projections.
//!
//! One convention everywhere: handlers return the bare result object, the
//! worker persists `{"success": true, "result": ...}` into
//! `tasks.result_data`, and every reader dereferences the `result` field.

use serde_json::{json, Value};

use strata_db::models::Task;

use crate::registry::StageTaskResult;

/// Wrap a handler's bare result into the stored envelope.
pub fn success_envelope(result: Value) -> Value {
    json!({ "success": true, "result": result })
}

/// Extract the bare result from a stored envelope.
///
/// A completed task whose handler returned no `result` field still counts
/// as completed; its result projects to JSON null.
pub fn envelope_result(result_data: Option<&Value>) -> Value {
    result_data
        .and_then(|v| v.get("result"))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Project one completed task row for consumption by the next stage's
/// task generator or by finalization.
pub fn project_task(task: &Task) -> StageTaskResult {
    StageTaskResult {
        task_id: task.task_id.clone(),
        success: true,
        result: envelope_result(task.result_data.as_ref()),
    }
}

/// Project a slice of completed task rows, preserving their order.
pub fn project_tasks(tasks: &[Task]) -> Vec<StageTaskResult> {
    tasks.iter().map(project_task).collect()
}
