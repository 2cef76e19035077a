//! Remote validation port.
//!
//! When configured, every downloaded advisory must pass the remote
//! validator before it is persisted.

use async_trait::async_trait;
use thiserror::Error;

/// Errors talking to the validator service.
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("validator request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("validator returned a malformed response: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of a remote validation.
#[derive(Clone, Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub messages: Vec<String>,
}

/// Port onto a remote CSAF validator service.
#[async_trait]
pub trait RemoteValidator: Send + Sync {
    async fn validate(&self, document: &serde_json::Value)
    -> Result<ValidationResult, ValidatorError>;
}
