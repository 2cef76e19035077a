//! Database error types.

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("database configuration error: {0}")]
    Config(String),
}

/// Result type for database operations.
pub type DbResult<T> = std::result::Result<T, DbError>;
