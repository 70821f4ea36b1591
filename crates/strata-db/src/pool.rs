//! Pool construction, database bootstrap, and migrations.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Open a pool sized by the config's connection budget.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;
    Ok(pool)
}

/// The migrations directory shipped inside the `strata-db` crate.
///
/// Resolves via the compile-time `CARGO_MANIFEST_DIR` of this crate, so
/// it is valid wherever the source tree is present (dev checkouts,
/// tests). Installed binaries that leave the tree behind must embed the
/// migrations themselves.
pub fn migrations_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

/// Apply all pending migrations.
///
/// Loads [`migrations_dir`] through a runtime `Migrator` so compiling
/// the crate never needs a live database (the `sqlx::migrate!` macro
/// would).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir())
        .await
        .context("failed to load migrations")?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied");
    Ok(())
}

/// Quote a Postgres identifier for interpolation into DDL, where bind
/// parameters are not accepted.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Create the configured database if it does not exist yet.
///
/// Goes through the server's `postgres` maintenance database on a
/// single short-lived connection. Returns `true` when the database was
/// created by this call.
pub async fn ensure_database(config: &DbConfig) -> Result<bool> {
    let db_name = config
        .database_name()
        .context("connection URL has no database name")?;
    let maintenance_url = config.maintenance_url();

    let mut admin = PgConnection::connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {maintenance_url}"))?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&mut admin)
            .await
            .context("failed to query pg_database")?;

    let created = if exists {
        info!(db = db_name, "database already exists");
        false
    } else {
        let ddl = format!("CREATE DATABASE {}", quote_ident(db_name));
        sqlx::query(&ddl)
            .execute(&mut admin)
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
        true
    };

    admin.close().await.ok();
    Ok(created)
}

/// Row counts for every table in the `public` schema, one round trip.
///
/// Builds a UNION ALL over the table list so `strata db-init` reports
/// exact counts without a query per table.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text \
         FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    if tables.is_empty() {
        return Ok(Vec::new());
    }

    let union = tables
        .iter()
        .map(|(name,)| {
            // Names come straight from pg_tables; quoting keeps unusual
            // identifiers valid inside the generated SQL.
            format!(
                "SELECT '{name}'::text AS table_name, COUNT(*)::bigint AS row_count FROM {}",
                quote_ident(name)
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ");

    let counts: Vec<(String, i64)> =
        sqlx::query_as(&format!("{union} ORDER BY table_name"))
            .fetch_all(pool)
            .await
            .context("failed to count table rows")?;

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("strata"), "\"strata\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn migrations_dir_points_into_this_crate() {
        let dir = migrations_dir();
        assert!(dir.ends_with("migrations"));
    }
}
