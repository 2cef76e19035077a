//! Advisory persistence port.
//!
//! The download pipeline hands finished documents to this port. What an
//! advisory *means* (tracking ids, revisions, dedup) is decided behind
//! it; the manager only cares whether storing succeeded.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

/// Errors from storing advisories.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("advisory rejected: {0}")]
    Rejected(String),

    #[error("storing advisory failed: {0}")]
    Internal(String),
}

/// Port onto the advisory store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Whether the store already has the document at `url` at least as
    /// fresh as `changed`. Used by feed refresh to skip known documents.
    async fn is_current(
        &self,
        url: &Url,
        changed: Option<OffsetDateTime>,
    ) -> Result<bool, StoreError>;

    /// Persist a downloaded advisory.
    async fn store(
        &self,
        source_id: i64,
        feed_id: i64,
        url: &Url,
        document: &serde_json::Value,
    ) -> Result<(), StoreError>;
}
