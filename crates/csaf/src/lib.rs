//! CSAF provider plumbing: provider metadata, feed listings, OpenPGP keys.
//!
//! The source manager consumes this crate through a handful of ports:
//! - [`PmdLoader`] fetches and validates provider-metadata documents
//! - [`KeysLoader`] fetches the OpenPGP keyring a provider advertises
//! - [`rolie`]/[`directory`] turn feed listings into candidate locations
//! - [`RemoteValidator`] and [`DocumentStore`] are implemented elsewhere;
//!   advisory-content semantics stay behind them

pub mod directory;
pub mod error;
pub mod keys;
pub mod pmd;
pub mod rolie;
pub mod store;
pub mod validator;

pub use error::CsafError;
pub use keys::{HttpKeysLoader, Keyring, KeysLoader};
pub use pmd::{HttpPmdLoader, LoadedProviderMetadata, PmdLoader, ProviderMetadata};
pub use store::{DocumentStore, StoreError};
pub use validator::{RemoteValidator, ValidationResult, ValidatorError};

use time::OffsetDateTime;
use url::Url;

/// A candidate advisory discovered on a feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredLocation {
    /// Where the advisory document lives.
    pub url: Url,
    /// When the feed says the document last changed.
    pub changed: Option<OffsetDateTime>,
    /// Advertised checksum documents (ROLIE `hash` links).
    pub hashes: Vec<Url>,
    /// Advertised detached signature (ROLIE `signature` link).
    pub signature: Option<Url>,
}

impl DiscoveredLocation {
    /// A location with only a URL, as directory feeds produce them.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            changed: None,
            hashes: Vec::new(),
            signature: None,
        }
    }
}
