//! CSAF layer error types.

use thiserror::Error;

/// Errors from fetching or interpreting provider documents.
#[derive(Debug, Error)]
pub enum CsafError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} fetching {url}")]
    Status {
        url: url::Url,
        status: reqwest::StatusCode,
    },

    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("openpgp error: {0}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("signature does not verify against any provider key")]
    BadSignature,

    #[error("{0}")]
    Malformed(String),
}

/// Result type for CSAF operations.
pub type CsafResult<T> = std::result::Result<T, CsafError>;
