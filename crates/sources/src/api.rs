//! Typed request and reply payloads of the public manager API.

use crate::error::Error;
use regex::Regex;
use scythe_core::config::SourcesConfig;
use scythe_core::loglevel::FeedLogLevel;
use time::OffsetDateTime;
use url::Url;

/// Queue statistics of a source or feed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct Stats {
    pub downloading: usize,
    pub waiting: usize,
}

/// Reply payload describing a source.
///
/// Credential material is reduced to presence flags; plaintext never
/// leaves the manager.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub attention: bool,
    pub status: Vec<String>,
    pub rate: Option<f64>,
    pub slots: Option<usize>,
    pub headers: Vec<String>,
    pub strict_mode: Option<bool>,
    pub insecure: Option<bool>,
    pub signature_check: Option<bool>,
    pub age: Option<time::Duration>,
    pub ignore_patterns: Vec<String>,
    pub has_client_cert_public: bool,
    pub has_client_cert_private: bool,
    pub has_client_cert_passphrase: bool,
    pub stats: Option<Stats>,
}

/// Reply payload describing a feed.
#[derive(Clone, Debug)]
pub struct FeedInfo {
    pub id: i64,
    pub label: String,
    pub url: Url,
    pub rolie: bool,
    pub log_level: FeedLogLevel,
    pub stats: Option<Stats>,
}

/// A source flagged for attention (or any source when `all` was asked).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttentionSource {
    pub id: i64,
    pub name: String,
    pub attention: bool,
}

/// The feeds a configured source subscribes from a provider.
#[derive(Clone, Debug)]
pub struct SourceSubscriptions {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub subscriptions: Vec<String>,
}

/// Outcome of a source update session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceUpdateOutcome {
    /// No recorded field changed anything.
    Unchanged,
    /// The update was persisted and applied.
    Updated,
    /// The update was persisted but re-deriving the client certificate
    /// failed, so the source was deactivated.
    Deactivated,
}

impl std::fmt::Display for SourceUpdateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unchanged => "unchanged",
            Self::Updated => "updated",
            Self::Deactivated => "deactivated",
        })
    }
}

/// Parameters for registering a new source.
#[derive(Clone, Debug, Default)]
pub struct AddSourceRequest {
    pub name: String,
    pub url: String,
    pub rate: Option<f64>,
    pub slots: Option<usize>,
    pub headers: Vec<String>,
    pub strict_mode: Option<bool>,
    pub insecure: Option<bool>,
    pub signature_check: Option<bool>,
    pub age: Option<time::Duration>,
    pub ignore_patterns: Vec<String>,
    pub client_cert_public: Option<Vec<u8>>,
    pub client_cert_private: Option<Vec<u8>>,
    pub client_cert_passphrase: Option<Vec<u8>>,
}

/// Filters for querying feed logs.
#[derive(Clone, Debug, Default)]
pub struct FeedLogQuery {
    /// Restrict to one feed; `None` queries the logs of all feeds.
    pub feed_id: Option<i64>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    /// Substring match on the message.
    pub search: Option<String>,
    pub levels: Vec<FeedLogLevel>,
    /// Negative means no limit.
    pub limit: i64,
    /// Negative means no offset.
    pub offset: i64,
    /// Also compute the total count (ignoring limit/offset).
    pub count: bool,
}

impl FeedLogQuery {
    /// Query everything for one feed.
    pub fn for_feed(feed_id: i64) -> Self {
        Self {
            feed_id: Some(feed_id),
            limit: -1,
            offset: -1,
            ..Self::default()
        }
    }
}

/// One feed log line.
#[derive(Clone, Debug)]
pub struct FeedLogEntry {
    pub feed_id: i64,
    pub time: OffsetDateTime,
    pub level: FeedLogLevel,
    pub message: String,
}

/// Check that every header has the form "Key: value" with a non-empty key.
pub(crate) fn validate_headers(headers: &[String]) -> Result<(), Error> {
    for header in headers {
        match header.split_once(':') {
            Some((key, _)) if !key.trim().is_empty() => {}
            _ => return Err(Error::invalid(format!("header {header:?} is invalid"))),
        }
    }
    Ok(())
}

/// Compile ignore patterns, rejecting the first one that does not parse.
pub(crate) fn as_regexps(patterns: &[String]) -> Result<Vec<Regex>, Error> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|err| Error::invalid(format!("invalid pattern {p:?}: {err}")))
        })
        .collect()
}

/// Check that the data contains at least one PEM block.
pub(crate) fn has_pem_block(data: &[u8]) -> bool {
    pem::parse_many(data).map(|blocks| !blocks.is_empty()).unwrap_or(false)
}

/// Normalise a rate request: reject out-of-range values, map 0 to unset.
pub(crate) fn normalize_rate(
    rate: Option<f64>,
    cfg: &SourcesConfig,
) -> Result<Option<f64>, Error> {
    match rate {
        None => Ok(None),
        Some(r) if r == 0.0 => Ok(None),
        Some(r) if r < 0.0 => Err(Error::invalid("'rate' out of range")),
        Some(r) if cfg.max_rate_per_source != 0.0 && r > cfg.max_rate_per_source => {
            Err(Error::invalid("'rate' out of range"))
        }
        Some(r) => Ok(Some(r)),
    }
}

/// Normalise a slots request: reject out-of-range values, map 0 to unset.
pub(crate) fn normalize_slots(
    slots: Option<usize>,
    cfg: &SourcesConfig,
) -> Result<Option<usize>, Error> {
    match slots {
        None => Ok(None),
        Some(0) => Ok(None),
        Some(s) if cfg.max_slots_per_source != 0 && s > cfg.max_slots_per_source => {
            Err(Error::invalid("'slots' out of range"))
        }
        Some(s) => Ok(Some(s)),
    }
}

/// Validate an age request against the configured upper bound.
pub(crate) fn check_age(
    age: Option<time::Duration>,
    cfg: &SourcesConfig,
) -> Result<Option<time::Duration>, Error> {
    match age {
        None => Ok(None),
        Some(a) if !a.is_positive() => Err(Error::invalid("invalid age value")),
        Some(a) => {
            if let Some(max) = cfg.max_age()
                && a > max
            {
                return Err(Error::invalid("invalid age value"));
            }
            Ok(Some(a))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SourcesConfig {
        SourcesConfig {
            max_rate_per_source: 4.0,
            max_slots_per_source: 5,
            max_age_secs: 3600,
            ..SourcesConfig::default()
        }
    }

    #[test]
    fn headers_need_a_key() {
        assert!(validate_headers(&["X-Auth: token".to_string()]).is_ok());
        assert!(validate_headers(&["no colon".to_string()]).is_err());
        assert!(validate_headers(&[": empty key".to_string()]).is_err());
        assert!(validate_headers(&["  : spaces".to_string()]).is_err());
    }

    #[test]
    fn patterns_must_compile() {
        assert_eq!(as_regexps(&[r"^https://".to_string()]).unwrap().len(), 1);
        assert!(as_regexps(&["[unclosed".to_string()]).is_err());
    }

    #[test]
    fn pem_block_detection() {
        let pem = b"-----BEGIN CERTIFICATE-----\nAQID\n-----END CERTIFICATE-----\n";
        assert!(has_pem_block(pem));
        assert!(!has_pem_block(b"just some bytes"));
    }

    #[test]
    fn rate_boundaries() {
        let cfg = cfg();
        assert_eq!(normalize_rate(None, &cfg).unwrap(), None);
        assert_eq!(normalize_rate(Some(0.0), &cfg).unwrap(), None);
        assert_eq!(normalize_rate(Some(2.0), &cfg).unwrap(), Some(2.0));
        assert!(normalize_rate(Some(4.5), &cfg).is_err());
        assert!(normalize_rate(Some(-1.0), &cfg).is_err());
        // Unlimited config accepts any positive rate.
        let unlimited = SourcesConfig::default();
        assert_eq!(normalize_rate(Some(100.0), &unlimited).unwrap(), Some(100.0));
    }

    #[test]
    fn slots_boundaries() {
        let cfg = cfg();
        assert_eq!(normalize_slots(Some(0), &cfg).unwrap(), None);
        assert_eq!(normalize_slots(Some(5), &cfg).unwrap(), Some(5));
        assert!(normalize_slots(Some(6), &cfg).is_err());
    }

    #[test]
    fn age_boundaries() {
        let cfg = cfg();
        assert!(check_age(Some(time::Duration::hours(2)), &cfg).is_err());
        assert_eq!(
            check_age(Some(time::Duration::minutes(30)), &cfg).unwrap(),
            Some(time::Duration::minutes(30))
        );
        assert!(check_age(Some(time::Duration::ZERO), &cfg).is_err());
    }

    #[test]
    fn outcome_strings() {
        assert_eq!(SourceUpdateOutcome::Unchanged.to_string(), "unchanged");
        assert_eq!(SourceUpdateOutcome::Updated.to_string(), "updated");
        assert_eq!(SourceUpdateOutcome::Deactivated.to_string(), "deactivated");
    }
}
