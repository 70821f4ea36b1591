//! Query layer: plain-string sqlx over the orchestration tables.

pub mod janitor;
pub mod jobs;
pub mod queue;
pub mod tasks;
