//! `strata queues`: broker backlog stats.

use anyhow::Result;
use sqlx::PgPool;

use strata_core::bus::{MessageBus, PgBus, JOBS_QUEUE, TASKS_QUEUE};

pub async fn run_queues(pool: &PgPool) -> Result<()> {
    let bus = PgBus::new(pool.clone());

    println!(
        "{:<8}  {:>8}  {:>9}  {}",
        "QUEUE", "VISIBLE", "IN-FLIGHT", "OLDEST"
    );
    for queue in [JOBS_QUEUE, TASKS_QUEUE] {
        let depth = bus.depth(queue).await?;
        let oldest = depth
            .oldest_age_secs
            .map(|s| format!("{s:.0}s"))
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{:<8}  {:>8}  {:>9}  {}",
            queue, depth.visible, depth.in_flight, oldest
        );
    }

    Ok(())
}
