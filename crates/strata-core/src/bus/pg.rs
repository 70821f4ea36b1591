//! Postgres-backed message bus.
//!
//! Queues live in the same database as the state store, which keeps the
//! deployment to one moving part. Visibility timeout and skip-locked
//! claiming give the same at-least-once semantics as a hosted broker;
//! the timeout must stay shorter than the janitor's stale-processing
//! cutoff so a dead worker's message reappears before the watchdog fires.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use strata_db::queries::queue;

use super::{AckToken, MessageBus, QueueDepth};

/// Default visibility timeout for claimed messages.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Message bus over the `queue_messages` table.
#[derive(Debug, Clone)]
pub struct PgBus {
    pool: PgPool,
    visibility: Duration,
}

impl PgBus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            visibility: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_visibility(pool: PgPool, visibility: Duration) -> Self {
        Self { pool, visibility }
    }
}

#[async_trait]
impl MessageBus for PgBus {
    async fn send(&self, queue: &str, body: &Value) -> Result<i64> {
        queue::send(&self.pool, queue, body).await
    }

    async fn receive(&self, queue_name: &str) -> Result<Option<(Value, AckToken)>> {
        let message =
            queue::receive(&self.pool, queue_name, self.visibility.as_secs() as i64).await?;
        Ok(message.map(|m| (m.body, m.id)))
    }

    async fn ack(&self, token: AckToken) -> Result<()> {
        queue::ack(&self.pool, token).await?;
        Ok(())
    }

    async fn nack(&self, token: AckToken) -> Result<()> {
        queue::nack(&self.pool, token).await?;
        Ok(())
    }

    async fn depth(&self, queue_name: &str) -> Result<QueueDepth> {
        queue::depth(&self.pool, queue_name).await
    }
}
