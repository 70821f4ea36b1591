//! Database-backed broker queues.
//!
//! Messages live in `queue_messages`. Delivery is at-least-once: a
//! `receive` claims the oldest visible message with `FOR UPDATE SKIP
//! LOCKED` and pushes its `visible_at` past the visibility timeout, so an
//! unacked message reappears on its own once the timeout lapses.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::QueueMessage;

/// Append a message to a queue. Returns the broker-assigned message ID.
pub async fn send(pool: &PgPool, queue: &str, body: &serde_json::Value) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO queue_messages (queue, body) VALUES ($1, $2) RETURNING id",
    )
    .bind(queue)
    .bind(body)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to send message to queue {queue}"))?;

    Ok(row.0)
}

/// Claim the next visible message, if any.
///
/// The claimed message stays invisible for `visibility_secs`; the caller
/// must [`ack`] within that window or the message is redelivered.
pub async fn receive(
    pool: &PgPool,
    queue: &str,
    visibility_secs: i64,
) -> Result<Option<QueueMessage>> {
    let message = sqlx::query_as::<_, QueueMessage>(
        "UPDATE queue_messages \
         SET visible_at = now() + make_interval(secs => $2), \
             read_count = read_count + 1 \
         WHERE id = ( \
             SELECT id FROM queue_messages \
             WHERE queue = $1 AND visible_at <= now() \
             ORDER BY id \
             FOR UPDATE SKIP LOCKED \
             LIMIT 1 \
         ) \
         RETURNING *",
    )
    .bind(queue)
    .bind(visibility_secs as f64)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to receive from queue {queue}"))?;

    Ok(message)
}

/// Acknowledge (delete) a delivered message.
pub async fn ack(pool: &PgPool, message_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM queue_messages WHERE id = $1")
        .bind(message_id)
        .execute(pool)
        .await
        .context("failed to ack message")?;

    Ok(result.rows_affected())
}

/// Negative-acknowledge a delivered message: make it visible again now
/// instead of waiting out the visibility timeout.
pub async fn nack(pool: &PgPool, message_id: i64) -> Result<u64> {
    let result = sqlx::query("UPDATE queue_messages SET visible_at = now() WHERE id = $1")
        .bind(message_id)
        .execute(pool)
        .await
        .context("failed to nack message")?;

    Ok(result.rows_affected())
}

/// Depth statistics for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueDepth {
    /// Messages eligible for delivery right now.
    pub visible: i64,
    /// Messages claimed and inside their visibility window.
    pub in_flight: i64,
    /// Age of the oldest message in seconds, if any.
    pub oldest_age_secs: Option<f64>,
}

/// Per-queue backlog stats for the operator surface.
pub async fn depth(pool: &PgPool, queue: &str) -> Result<QueueDepth> {
    let row: (i64, i64, Option<f64>) = sqlx::query_as(
        "SELECT \
             COUNT(*) FILTER (WHERE visible_at <= now()), \
             COUNT(*) FILTER (WHERE visible_at > now()), \
             EXTRACT(EPOCH FROM (now() - MIN(enqueued_at)))::float8 \
         FROM queue_messages \
         WHERE queue = $1",
    )
    .bind(queue)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to get depth for queue {queue}"))?;

    Ok(QueueDepth {
        visible: row.0,
        in_flight: row.1,
        oldest_age_secs: row.2,
    })
}
