//! Deterministic job and task identity.
//!
//! Task IDs are derived from `(job_id, stage, logical_unit)`, so a task
//! can compute the ID of the task that processed the same logical unit in
//! the previous or next stage without a database lookup. Job IDs are
//! derived from the job type plus its normalized parameters, making
//! submission idempotent: identical parameters always address the same
//! job row.
//!
//! Everything here is a pure function; no I/O.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Logical unit of the controller-synthesized fan-in aggregator task.
pub const AGGREGATE_UNIT: &str = "aggregate";

/// Parameters that steer a run without changing what work it describes.
/// They are stripped before hashing so a dry run and a real run of the
/// same parameters share a job identity.
const CONTROL_FLAGS: &[&str] = &["dry_run", "force_reprocess"];

/// Derive the 16-hex-char deterministic task ID.
///
/// Formula: `sha256("{job_id}|s{stage}|{logical_unit}")[..16]`.
///
/// The truncation to 64 bits is safe because uniqueness only needs to
/// hold within one `(job_id, stage)` scope.
pub fn task_id(job_id: &str, stage: i32, logical_unit: &str) -> String {
    let composite = format!("{job_id}|s{stage}|{logical_unit}");
    let digest = Sha256::digest(composite.as_bytes());
    hex::encode(digest)[..16].to_owned()
}

/// Task ID of the same logical unit in the previous stage.
///
/// Returns `None` for stage 1, which has no predecessor.
pub fn predecessor_task_id(job_id: &str, stage: i32, logical_unit: &str) -> Option<String> {
    if stage <= 1 {
        return None;
    }
    Some(task_id(job_id, stage - 1, logical_unit))
}

/// Task ID of the same logical unit in the next stage.
pub fn successor_task_id(job_id: &str, stage: i32, logical_unit: &str) -> String {
    task_id(job_id, stage + 1, logical_unit)
}

/// Derive the 64-hex-char job ID from the job type and its normalized
/// parameters.
///
/// Control flags are stripped from the top level and the remainder is
/// serialized canonically (recursively sorted keys), so key order and
/// steering flags never change the identity.
pub fn job_id(job_type: &str, parameters: &Value) -> String {
    let stripped = strip_control_flags(parameters);
    let canonical = canonical_string(&stripped);
    let composite = format!("{job_type}:{canonical}");
    hex::encode(Sha256::digest(composite.as_bytes()))
}

/// Remove control flags from the top level of a parameters object.
/// Non-object values pass through unchanged.
pub fn strip_control_flags(parameters: &Value) -> Value {
    match parameters {
        Value::Object(map) => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !CONTROL_FLAGS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(filtered)
        }
        other => other.clone(),
    }
}

/// Serialize a JSON value with object keys recursively sorted.
///
/// Hand-rolled rather than relying on map iteration order so the result
/// is stable regardless of how the value was built or which serde_json
/// features are enabled downstream.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
