//! The message bus seam: two logical queues with at-least-once delivery.
//!
//! The engine only relies on `send`/`receive`/`ack`/`nack` with a
//! visibility timeout; everything else (redelivery tolerance, duplicate
//! suppression) is handled by status-gated guards against the state
//! store, which remains the source of truth.

pub mod pg;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use pg::PgBus;
pub use strata_db::queries::queue::QueueDepth;

/// Logical queue consumed by the job controller.
pub const JOBS_QUEUE: &str = "jobs";
/// Logical queue consumed by task workers.
pub const TASKS_QUEUE: &str = "tasks";

/// Broker-assigned handle used to ack or nack a delivery.
pub type AckToken = i64;

/// Correlation ID shared by every message of one job: the leading 128
/// bits of the job identity, folded into a UUID.
///
/// Deriving it from the job ID (instead of minting per message) means
/// submission, every stage advancement, and every janitor rescue of the
/// same job log the same correlation ID, so one grep follows the whole
/// lifecycle.
pub fn job_correlation_id(job_id: &str) -> Uuid {
    let mut bytes = [0u8; 16];
    if let Ok(decoded) = hex::decode(job_id.get(..32).unwrap_or_default()) {
        if decoded.len() == 16 {
            bytes.copy_from_slice(&decoded);
        }
    }
    Uuid::from_bytes(bytes)
}

/// Message driving the job controller for one `(job, stage)` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQueueMessage {
    pub job_id: String,
    pub job_type: String,
    pub stage: i32,
    pub parameters: Value,
    pub attempt: i32,
    pub correlation_id: Uuid,
}

impl JobQueueMessage {
    /// Message driving the given stage of a job, correlated by the
    /// job's lifecycle-stable ID.
    pub fn for_job(job_id: &str, job_type: &str, stage: i32, parameters: Value) -> Self {
        Self {
            job_id: job_id.to_owned(),
            job_type: job_type.to_owned(),
            stage,
            parameters,
            attempt: 1,
            correlation_id: job_correlation_id(job_id),
        }
    }

    /// Message for stage 1 of a freshly submitted job.
    pub fn initial(job_id: &str, job_type: &str, parameters: Value) -> Self {
        Self::for_job(job_id, job_type, 1, parameters)
    }
}

/// Message dispatching one task to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueMessage {
    pub task_id: String,
    pub parent_job_id: String,
    pub task_type: String,
    pub stage: i32,
    pub parameters: Value,
    pub correlation_id: Uuid,
}

/// Object-safe broker interface.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append a message; returns the broker-assigned message ID.
    async fn send(&self, queue: &str, body: &Value) -> Result<i64>;

    /// Claim the next visible message, if any. The message stays
    /// invisible for the bus's visibility timeout.
    async fn receive(&self, queue: &str) -> Result<Option<(Value, AckToken)>>;

    /// Acknowledge a delivery; the message is gone for good.
    async fn ack(&self, token: AckToken) -> Result<()>;

    /// Reject a delivery; the message becomes visible again immediately.
    async fn nack(&self, token: AckToken) -> Result<()>;

    /// Backlog stats for one queue.
    async fn depth(&self, queue: &str) -> Result<QueueDepth>;
}

// Compile-time assertion: MessageBus must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn MessageBus) {}
};

/// Serialize and send a typed message.
pub async fn send_message<T: Serialize>(
    bus: &dyn MessageBus,
    queue: &str,
    message: &T,
) -> Result<i64> {
    let body = serde_json::to_value(message).context("failed to serialize queue message")?;
    bus.send(queue, &body).await
}

/// Receive and decode a typed message.
///
/// A body that does not decode is a poison message: it is acked away (it
/// would never decode on redelivery either) and reported as an error.
pub async fn receive_message<T: DeserializeOwned>(
    bus: &dyn MessageBus,
    queue: &str,
) -> Result<Option<(T, AckToken)>> {
    let Some((body, token)) = bus.receive(queue).await? else {
        return Ok(None);
    };

    match serde_json::from_value::<T>(body) {
        Ok(message) => Ok(Some((message, token))),
        Err(e) => {
            bus.ack(token).await?;
            Err(anyhow::anyhow!(
                "dropped undecodable message from queue {queue}: {e}"
            ))
        }
    }
}
