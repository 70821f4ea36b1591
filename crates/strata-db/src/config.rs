//! Database configuration and connection budgeting.
//!
//! The engine shares one pool between the controller loop, every task
//! worker, and the janitor ticker, so the pool size is derived from the
//! worker concurrency rather than guessed. One-shot CLI commands get a
//! small fixed budget instead.

use std::env;
use std::time::Duration;

/// Environment variable holding the connection URL.
pub const ENV_DATABASE_URL: &str = "STRATA_DATABASE_URL";
/// Environment variable overriding the pool size.
pub const ENV_MAX_CONNECTIONS: &str = "STRATA_DB_MAX_CONNECTIONS";

/// Pool size used when nothing more specific is known (CLI one-shots,
/// tests).
const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// How long to wait for a pooled connection before giving up.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL, possibly with query parameters
    /// (`?sslmode=require` and friends).
    pub database_url: String,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
    /// Acquire timeout applied to every pool checkout.
    pub acquire_timeout: Duration,
}

impl DbConfig {
    /// The connection URL used when nothing else is configured.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/strata";

    /// Build a config from the environment.
    ///
    /// `STRATA_DATABASE_URL` supplies the URL and
    /// `STRATA_DB_MAX_CONNECTIONS` may override the pool size; anything
    /// unparsable falls back to the defaults.
    pub fn from_env() -> Self {
        let database_url =
            env::var(ENV_DATABASE_URL).unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let max_connections = env::var(ENV_MAX_CONNECTIONS)
            .ok()
            .and_then(|raw| raw.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        Self {
            database_url,
            max_connections,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Build a config from an explicit URL with the default budget
    /// (tests, CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Build a config sized for an engine process.
    ///
    /// Budget: one connection per task worker, one for the controller
    /// loop, one for the janitor, plus two spare for the completion
    /// protocol's transactions.
    pub fn for_engine(database_url: impl Into<String>, worker_concurrency: usize) -> Self {
        let workers = worker_concurrency.max(1) as u32;
        Self {
            database_url: database_url.into(),
            max_connections: workers + 4,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// The database name addressed by the URL, with any query or
    /// fragment suffix stripped.
    ///
    /// Returns `None` when the URL has no name segment at all.
    pub fn database_name(&self) -> Option<&str> {
        let (_, last_segment) = self.database_url.rsplit_once('/')?;
        let name = last_segment
            .split(['?', '#'])
            .next()
            .unwrap_or(last_segment);
        if name.is_empty() { None } else { Some(name) }
    }

    /// The same server addressed through its `postgres` maintenance
    /// database, preserving any query parameters (TLS options must
    /// survive the switch).
    ///
    /// Used to issue `CREATE DATABASE` before the target exists.
    pub fn maintenance_url(&self) -> String {
        let Some((prefix, last_segment)) = self.database_url.rsplit_once('/') else {
            return self.database_url.clone();
        };
        match last_segment.find(['?', '#']) {
            Some(suffix_at) => {
                format!("{prefix}/postgres{}", &last_segment[suffix_at..])
            }
            None => format!("{prefix}/postgres"),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
