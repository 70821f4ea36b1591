//! `strata status` and `strata tasks`: inspect jobs and their tasks.

use anyhow::{bail, Result};
use sqlx::PgPool;

use strata_db::queries::{jobs as job_db, tasks as task_db};

/// Show one job in detail, or list recent jobs when no ID is given.
pub async fn run_status(pool: &PgPool, job_id: Option<&str>) -> Result<()> {
    match job_id {
        Some(job_id) => {
            let Some(job) = job_db::get_job(pool, job_id).await? else {
                bail!("job {job_id} not found");
            };

            println!("Job {}", job.job_id);
            println!("  type:          {}", job.job_type);
            println!("  status:        {}", job.status);
            println!("  stage:         {}/{}", job.stage, job.total_stages);
            println!("  created:       {}", job.created_at.to_rfc3339());
            println!("  updated:       {}", job.updated_at.to_rfc3339());
            if let Some(error) = &job.error_details {
                println!("  error:         {error}");
            }
            if let Some(result) = &job.result_data {
                println!("  result:        {result}");
            }

            let tasks = task_db::list_tasks_for_job(pool, job_id).await?;
            let completed = tasks
                .iter()
                .filter(|t| t.status == strata_db::models::TaskStatus::Completed)
                .count();
            println!("  tasks:         {completed}/{} completed", tasks.len());
        }
        None => {
            let jobs = job_db::list_jobs(pool, 50).await?;
            if jobs.is_empty() {
                println!("No jobs.");
                return Ok(());
            }

            println!(
                "{:<16}  {:<28}  {:<10}  {:>5}  {}",
                "JOB", "TYPE", "STATUS", "STAGE", "UPDATED"
            );
            for job in &jobs {
                println!(
                    "{:<16}  {:<28}  {:<10}  {:>2}/{:<2}  {}",
                    &job.job_id[..16.min(job.job_id.len())],
                    job.job_type,
                    job.status.to_string(),
                    job.stage,
                    job.total_stages,
                    job.updated_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

/// Show the task table for one job.
pub async fn run_tasks(pool: &PgPool, job_id: &str) -> Result<()> {
    let Some(job) = job_db::get_job(pool, job_id).await? else {
        bail!("job {job_id} not found");
    };

    let tasks = task_db::list_tasks_for_job(pool, &job.job_id).await?;
    if tasks.is_empty() {
        println!("No tasks for job {}.", job.job_id);
        return Ok(());
    }

    println!(
        "{:<16}  {:>5}  {:<24}  {:<10}  {:>7}  {}",
        "TASK", "STAGE", "TYPE", "STATUS", "RETRIES", "UPDATED"
    );
    for task in &tasks {
        println!(
            "{:<16}  {:>5}  {:<24}  {:<10}  {:>7}  {}",
            task.task_id,
            task.stage,
            task.task_type,
            task.status.to_string(),
            task.retry_count,
            task.updated_at.to_rfc3339()
        );
        if let Some(error) = &task.error_details {
            println!("    error: {error}");
        }
    }

    Ok(())
}
