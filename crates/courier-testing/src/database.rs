//! PostgreSQL databases for integration tests.
//!
//! Each [`TestDatabase`] is a freshly created, migrated database so tests can
//! run in parallel without sharing outbox rows. Requires `DATABASE_URL`
//! pointing at a server where the user may create databases.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_core::{PostgresStore, Storage};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Isolated, migrated database.
#[derive(Debug)]
pub struct TestDatabase {
    pool: PgPool,
    database_name: String,
}

impl TestDatabase {
    /// Creates and migrates a new database.
    pub async fn new() -> Result<Self> {
        let admin = admin_pool().await?;
        let database_name = format!("courier_test_{}", Uuid::new_v4().simple());

        sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
            .execute(&admin)
            .await
            .with_context(|| format!("failed to create database {database_name}"))?;
        admin.close().await;

        let options = connect_options()?.database(&database_name);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to {database_name}"))?;

        Storage::new(pool.clone()).migrate().await.context("failed to migrate test database")?;
        debug!(database = %database_name, "test database ready");

        Ok(Self { pool, database_name })
    }

    /// Connection pool for this database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Database name.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Repository container over this database.
    pub fn storage(&self) -> Storage {
        Storage::new(self.pool.clone())
    }

    /// Persistence ports over this database.
    pub fn store(&self) -> PostgresStore {
        PostgresStore::from_pool(self.pool.clone())
    }

    /// Closes connections and drops the database.
    pub async fn drop_database(self) -> Result<()> {
        self.pool.close().await;
        let admin = admin_pool().await?;
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.database_name))
            .execute(&admin)
            .await
            .with_context(|| format!("failed to drop database {}", self.database_name))?;
        admin.close().await;
        Ok(())
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if !self.pool.is_closed() {
            warn!(database = %self.database_name, "test database left behind; call drop_database");
        }
    }
}

fn connect_options() -> Result<PgConnectOptions> {
    let url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL environment variable is required")?;
    url.parse::<PgConnectOptions>().context("failed to parse DATABASE_URL")
}

// Pools are bound to the runtime that created them and every #[tokio::test]
// has its own, so the admin pool is not cached.
async fn admin_pool() -> Result<PgPool> {
    let options = connect_options()?.database("postgres");
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
        .context("failed to connect to admin database")
}
