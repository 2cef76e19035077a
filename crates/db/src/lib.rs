//! Postgres persistence layer.
//!
//! All SQL in the workspace runs through [`Database::run`], which acquires
//! a pooled connection for the duration of the given closure and retries
//! transient failures. The pool itself is thread-safe and cheap to clone.

mod error;

pub use error::{DbError, DbResult};

use futures::future::BoxFuture;
use scythe_core::config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, PgConnection};
use std::time::Duration;

/// Schema bootstrap (embedded).
const SCHEMA: &str = include_str!("schema.sql");

/// The `feed_logs_level` enum type; created outside the main schema file
/// because `CREATE TYPE` has no `IF NOT EXISTS` form.
const FEED_LOGS_LEVEL_TYPE: &str =
    "CREATE TYPE feed_logs_level AS ENUM ('debug', 'info', 'warn', 'error')";

/// Delay between retries of transient failures.
const RETRY_DELAY: Duration = Duration::from_millis(500);

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Handle onto the Postgres pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database described by the configuration.
    pub async fn connect(cfg: &DatabaseConfig) -> DbResult<Self> {
        if cfg.url.is_empty() {
            return Err(DbError::Config("database.url must be set".to_string()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables the source manager writes if they do not exist.
    pub async fn ensure_schema(&self) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        if let Err(err) = sqlx::query(FEED_LOGS_LEVEL_TYPE)
            .execute(conn.as_mut())
            .await
        {
            // 42710: duplicate_object, the type already exists.
            let duplicate = matches!(
                &err,
                sqlx::Error::Database(db) if db.code().as_deref() == Some("42710")
            );
            if !duplicate {
                return Err(err.into());
            }
        }
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(conn.as_mut()).await?;
        }
        Ok(())
    }

    /// Run `f` with a pooled connection, retrying transient failures up
    /// to `retries` times.
    pub async fn run<T, F>(&self, mut f: F, retries: u32) -> DbResult<T>
    where
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            let result = async {
                let mut conn = self.pool.acquire().await?;
                f(conn.as_mut()).await
            }
            .await;
            match result {
                Ok(v) => return Ok(v),
                Err(err) if attempt < retries && is_transient(&err) => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        retries,
                        error = %err,
                        "transient database error, retrying"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Run `f` inside a transaction on a pooled connection.
    pub async fn run_tx<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>>,
    {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        match f(tx.as_mut()).await {
            Ok(v) => {
                tx.commit().await?;
                Ok(v)
            }
            Err(err) => {
                // Rollback happens on drop; surface the original error.
                Err(err.into())
            }
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_statements() {
        let statements = schema_statements(SCHEMA);
        assert!(statements.len() >= 5);
        assert!(statements.iter().all(|s| !s.trim().is_empty()));
        // Comment-only fragments are dropped.
        let statements = schema_statements("-- nothing\n;\nSELECT 1;");
        assert_eq!(statements, vec!["SELECT 1"]);
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }
}
