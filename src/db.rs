//! Database connection management and migrations.

use crate::error::{DbError, Result};
use anyhow::Context as _;
use sqlx::SqlitePool;
use std::path::Path;

/// Daemon database bundle.
pub struct Db {
    /// SQLite pool for the usage ledger and finalized messages.
    pub sqlite: SqlitePool,
}

impl Db {
    /// Connect and run migrations.
    pub async fn connect(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;

        let sqlite_url = format!("sqlite:{}?mode=rwc", data_dir.join("datachat.db").display());
        let sqlite = SqlitePool::connect(&sqlite_url)
            .await
            .map_err(DbError::Sqlx)?;

        sqlx::migrate!("./migrations")
            .run(&sqlite)
            .await
            .map_err(DbError::Migrate)?;

        Ok(Self { sqlite })
    }

    /// Close the database connection gracefully.
    pub async fn close(self) {
        self.sqlite.close().await;
    }
}

/// In-memory database for tests; runs the same migrations.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}
