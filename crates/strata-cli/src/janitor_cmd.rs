//! `strata janitor`: one-shot reconciliation pass and run history.
//!
//! The stock binary runs the registry-free passes (task watchdog and job
//! health). The orphan & zombie detector re-triggers stage advancement,
//! which needs the deployment's job classes; embedders run it through
//! the engine's janitor ticker instead.

use anyhow::Result;
use sqlx::PgPool;

use strata_core::bus::PgBus;
use strata_core::janitor::{self, JanitorConfig, PassReport};
use strata_db::queries::janitor as janitor_db;

/// Run the registry-free janitor passes once and print their reports.
pub async fn run_janitor(pool: &PgPool) -> Result<()> {
    let bus = PgBus::new(pool.clone());
    let config = JanitorConfig::default();

    let reports = vec![
        janitor::run_task_watchdog(pool, &bus, &config).await?,
        janitor::run_job_health(pool, &config).await?,
    ];

    for report in &reports {
        print_report(report);
    }

    Ok(())
}

fn print_report(report: &PassReport) {
    println!(
        "{}: scanned {}, fixed {} (run {})",
        report.run_type, report.items_scanned, report.items_fixed, report.run_id
    );
    for action in &report.actions {
        println!("  {action}");
    }
}

/// Print recent janitor runs.
pub async fn run_history(pool: &PgPool, hours: i64) -> Result<()> {
    let runs = janitor_db::recent_runs(pool, hours, None, 50).await?;
    if runs.is_empty() {
        println!("No janitor runs in the last {hours}h.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<10}  {:>7}  {:>5}  {:>9}",
        "RUN", "TYPE", "STATUS", "SCANNED", "FIXED", "DURATION"
    );
    for run in &runs {
        let duration = run
            .duration_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{:<36}  {:<16}  {:<10}  {:>7}  {:>5}  {:>9}",
            run.run_id,
            run.run_type.to_string(),
            run.status.to_string(),
            run.items_scanned,
            run.items_fixed,
            duration
        );
    }

    Ok(())
}
