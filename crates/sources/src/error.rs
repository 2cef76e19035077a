//! Source manager error types.

use thiserror::Error;

/// Errors surfaced to callers of the source manager.
///
/// `NoSuchEntry` and `InvalidArgument` are the two client-facing
/// sentinels (mapped to 404 and 400 by the front-end); everything else
/// is an internal failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NoSuchEntry(&'static str),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Database(#[from] scythe_db::DbError),

    #[error("encryption error: {0}")]
    Crypto(#[from] scythe_core::crypto::CryptoError),

    #[error("manager is not running")]
    ManagerClosed,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for validation failures.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Whether this error should map to "not found".
    pub fn is_no_such_entry(&self) -> bool {
        matches!(self, Self::NoSuchEntry(_))
    }

    /// Whether this error should map to "bad request".
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}
