//! `strata submit`: submit a job against the registry linked into this
//! binary.
//!
//! Job classes are registered by the deployment that embeds the engine;
//! the stock binary carries an empty registry and will report unknown
//! job types. Everything else (identity derivation, idempotent insert,
//! stage-1 enqueue) is exercised through the shared submission surface.

use anyhow::{bail, Context, Result};
use sqlx::PgPool;

use strata_core::bus::PgBus;
use strata_core::registry::JobRegistry;
use strata_core::submit;
use strata_core::SubmitError;

pub async fn run_submit(
    pool: &PgPool,
    registry: &JobRegistry,
    job_type: &str,
    params_json: Option<&str>,
    params_file: Option<&str>,
) -> Result<()> {
    let raw = match (params_json, params_file) {
        (Some(inline), None) => inline.to_owned(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read parameters file {path}"))?,
        (None, None) => "{}".to_owned(),
        (Some(_), Some(_)) => bail!("pass either --params or --params-file, not both"),
    };

    let parameters: serde_json::Value =
        serde_json::from_str(&raw).context("parameters are not valid JSON")?;

    let bus = PgBus::new(pool.clone());

    match submit::submit(pool, &bus, registry, job_type, &parameters).await {
        Ok(receipt) => {
            if receipt.queued {
                println!("Job {} queued.", receipt.job_id);
            } else {
                println!("Job {} already exists; nothing enqueued.", receipt.job_id);
            }
            Ok(())
        }
        Err(SubmitError::UnknownJobType(t)) => {
            if registry.is_empty() {
                bail!(
                    "unknown job type {t:?}: this binary has no job classes registered \
                     (job classes are linked in by the embedding deployment)"
                );
            }
            bail!("unknown job type {t:?} (registered: {:?})", registry.list());
        }
        Err(SubmitError::InvalidParameters(e)) => bail!("{e}"),
        Err(SubmitError::Internal(e)) => Err(e),
    }
}
