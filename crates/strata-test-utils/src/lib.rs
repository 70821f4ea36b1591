//! Integration-test databases for the strata workspace.
//!
//! [`TestDb`] hands each test a freshly created, fully migrated database
//! on a shared PostgreSQL server and tears it down again through
//! [`TestDb::finish`]. The server comes from `STRATA_TEST_PG_URL` when a
//! CI setup script already runs one, and from a lazily started
//! testcontainers instance otherwise (PostgreSQL 13+ assumed either
//! way; teardown relies on `DROP DATABASE ... WITH (FORCE)`).
//!
//! Pools are opened through strata's own [`DbConfig`]/[`create_pool`]
//! surface so the tests exercise the same connection path production
//! code uses.

use sqlx::{Connection, PgConnection, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use strata_db::config::DbConfig;
use strata_db::pool::{create_pool, run_migrations};

/// The shared server: its root URL, plus the container handle when we
/// started one ourselves (held so it stays alive for the process).
struct PgServer {
    url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static PG_SERVER: OnceCell<PgServer> = OnceCell::const_new();

/// Root URL of the shared PostgreSQL server (no database name appended).
async fn server_url() -> &'static str {
    let server = PG_SERVER
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("STRATA_TEST_PG_URL") {
                return PgServer {
                    url,
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");

            PgServer {
                url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: Some(container),
            }
        })
        .await;
    &server.url
}

/// Open a one-off admin connection to the server's `postgres` database.
async fn admin_connection() -> PgConnection {
    let url = format!("{}/postgres", server_url().await);
    PgConnection::connect(&url)
        .await
        .expect("failed to open admin connection to test server")
}

/// One isolated, migrated database for the lifetime of a test.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Create a uniquely named database, run the strata migrations, and
    /// open a pool onto it.
    pub async fn new() -> Self {
        let name = format!("strata_{}", Uuid::new_v4().simple());

        let mut admin = admin_connection().await;
        let ddl = format!("CREATE DATABASE \"{name}\"");
        sqlx::query(&ddl)
            .execute(&mut admin)
            .await
            .unwrap_or_else(|e| panic!("failed to create test database {name}: {e}"));
        admin.close().await.ok();

        let config = DbConfig::new(format!("{}/{name}", server_url().await));
        let pool = create_pool(&config)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to test database {name}: {e}"));
        run_migrations(&pool)
            .await
            .expect("migrations should apply to a fresh test database");

        Self { pool, name }
    }

    /// Name of the underlying database (useful in failure messages).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the pool and drop the database.
    ///
    /// `WITH (FORCE)` kicks any straggling connections, so a test that
    /// leaked a clone of the pool still cleans up. Skipping `finish`
    /// leaks the database on the shared server but breaks nothing.
    pub async fn finish(self) {
        self.pool.close().await;

        let mut admin = admin_connection().await;
        let ddl = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.name);
        let _ = sqlx::query(&ddl).execute(&mut admin).await;
        admin.close().await.ok();
    }
}
