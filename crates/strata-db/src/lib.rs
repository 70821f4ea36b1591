//! Persistence layer for the strata orchestration engine.
//!
//! Models, connection pool, migrations, and the query functions for the
//! `jobs`, `tasks`, `janitor_runs`, and `queue_messages` tables.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
