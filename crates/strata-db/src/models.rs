use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the status is terminal (no further transitions on the main path).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// Tasks share the job status vocabulary. Terminal statuses are sticky:
/// only the janitor's explicit requeue moves a row out of them, and that
/// path targets `queued` again with an incremented retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Parallelism declared by a stage -- determines how the controller
/// generates tasks for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageParallelism {
    /// Exactly one task, produced by the job class.
    Single,
    /// One task per logical unit, produced by the job class.
    FanOut,
    /// Exactly one aggregator task, synthesized by the controller.
    FanIn,
}

impl fmt::Display for StageParallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Single => "single",
            Self::FanOut => "fan_out",
            Self::FanIn => "fan_in",
        };
        f.write_str(s)
    }
}

impl FromStr for StageParallelism {
    type Err = StageParallelismParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "fan_out" => Ok(Self::FanOut),
            "fan_in" => Ok(Self::FanIn),
            other => Err(StageParallelismParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StageParallelism`] string.
#[derive(Debug, Clone)]
pub struct StageParallelismParseError(pub String);

impl fmt::Display for StageParallelismParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid stage parallelism: {:?}", self.0)
    }
}

impl std::error::Error for StageParallelismParseError {}

// ---------------------------------------------------------------------------

/// Which janitor pass produced an audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JanitorRunType {
    TaskWatchdog,
    JobHealth,
    OrphanDetector,
}

impl fmt::Display for JanitorRunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskWatchdog => "task_watchdog",
            Self::JobHealth => "job_health",
            Self::OrphanDetector => "orphan_detector",
        };
        f.write_str(s)
    }
}

impl FromStr for JanitorRunType {
    type Err = JanitorRunTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_watchdog" => Ok(Self::TaskWatchdog),
            "job_health" => Ok(Self::JobHealth),
            "orphan_detector" => Ok(Self::OrphanDetector),
            other => Err(JanitorRunTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JanitorRunType`] string.
#[derive(Debug, Clone)]
pub struct JanitorRunTypeParseError(pub String);

impl fmt::Display for JanitorRunTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid janitor run type: {:?}", self.0)
    }
}

impl std::error::Error for JanitorRunTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a janitor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JanitorRunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JanitorRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JanitorRunStatus {
    type Err = JanitorRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(JanitorRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JanitorRunStatus`] string.
#[derive(Debug, Clone)]
pub struct JanitorRunStatusParseError(pub String);

impl fmt::Display for JanitorRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid janitor run status: {:?}", self.0)
    }
}

impl std::error::Error for JanitorRunStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A job -- the top-level unit of work.
///
/// `job_id` is the 64-hex-char SHA-256 of the job type plus its normalized
/// parameters, so resubmitting identical parameters addresses the same row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    /// Current stage being executed, 1..=total_stages. Monotonically
    /// non-decreasing over the job's lifetime.
    pub stage: i32,
    pub total_stages: i32,
    /// Snapshot of completed stage outputs, keyed by stage number.
    pub stage_results: serde_json::Value,
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task -- one unit of work within a stage.
///
/// `task_id` is the 16-hex-char deterministic ID derived from
/// `(parent_job_id, stage, logical_unit)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub task_id: String,
    pub parent_job_id: String,
    pub job_type: String,
    pub task_type: String,
    pub stage: i32,
    pub task_index: i32,
    pub status: TaskStatus,
    pub parameters: serde_json::Value,
    pub result_data: Option<serde_json::Value>,
    pub error_details: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit record for one janitor pass.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JanitorRun {
    pub run_id: Uuid,
    pub run_type: JanitorRunType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JanitorRunStatus,
    pub items_scanned: i32,
    pub items_fixed: i32,
    pub actions_taken: serde_json::Value,
    pub error_details: Option<String>,
    pub duration_ms: Option<i64>,
}

/// A message parked in one of the broker queues.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueMessage {
    pub id: i64,
    pub queue: String,
    pub body: serde_json::Value,
    /// When the message next becomes eligible for delivery. Receiving a
    /// message pushes this into the future by the visibility timeout.
    pub visible_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub read_count: i32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
