//! Core domain types shared across the scythe crates.
//!
//! This crate defines the pieces every other crate agrees on:
//! - Configuration types with their defaults
//! - Feed log levels (atomic-friendly, parseable)
//! - The crypto box used to keep credential material encrypted at rest

pub mod config;
pub mod crypto;
pub mod loglevel;

pub use config::{AppConfig, DatabaseConfig, SourcesConfig};
pub use crypto::CryptoBox;
pub use loglevel::FeedLogLevel;

/// Status string attached to a source that was deactivated because its
/// client certificate could not be turned into a usable TLS identity.
pub const DEACTIVATED_DUE_TO_CLIENT_CERT_ISSUE: &str = "deactivated_due_to_client_cert_issue";
