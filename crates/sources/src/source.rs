//! Sources: configured CSAF providers and their runtime state.

use crate::api::Stats;
use crate::feed::Feed;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use scythe_core::config::SourcesConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

/// Timeout for any single HTTP request of this source.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Problems turning a source's settings into a usable HTTP client.
#[derive(Debug, Error)]
pub(crate) enum ClientError {
    #[error("invalid extra header {0:?}")]
    Header(String),

    #[error("client certificate incomplete: missing {0}")]
    MissingPart(&'static str),

    #[error("client certificate is not valid PEM: {0}")]
    Pem(#[from] pem::PemError),

    #[error("decrypting private key failed: {0}")]
    Pkcs8(String),

    #[error("private key has no encrypted PKCS#8 block although a passphrase is set")]
    NotEncrypted,

    #[error("building TLS identity failed: {0}")]
    Identity(#[source] reqwest::Error),

    #[error("building HTTP client failed: {0}")]
    Build(#[source] reqwest::Error),
}

/// A configured CSAF provider.
pub(crate) struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub rate: Option<f64>,
    pub slots: Option<usize>,
    pub headers: Vec<String>,
    pub strict_mode: Option<bool>,
    pub insecure: Option<bool>,
    pub signature_check: Option<bool>,
    pub age: Option<time::Duration>,
    pub ignore_patterns: Vec<Regex>,
    pub client_cert_public: Option<Vec<u8>>,
    /// Plaintext in memory; the database only ever sees ciphertext.
    pub client_cert_private: Option<Vec<u8>>,
    pub client_cert_passphrase: Option<Vec<u8>>,
    pub status: Vec<String>,
    pub checksum_ack: OffsetDateTime,
    pub checksum_updated: OffsetDateTime,
    pub used_slots: usize,
    pub feeds: Vec<Feed>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    client: Option<Arc<reqwest::Client>>,
}

impl Source {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: i64,
        name: String,
        url: String,
        active: bool,
        rate: Option<f64>,
        slots: Option<usize>,
        headers: Vec<String>,
        strict_mode: Option<bool>,
        insecure: Option<bool>,
        signature_check: Option<bool>,
        age: Option<time::Duration>,
        ignore_patterns: Vec<Regex>,
        client_cert_public: Option<Vec<u8>>,
        client_cert_private: Option<Vec<u8>>,
        client_cert_passphrase: Option<Vec<u8>>,
        status: Vec<String>,
        checksum_ack: OffsetDateTime,
        checksum_updated: OffsetDateTime,
    ) -> Self {
        let limiter = make_limiter(rate);
        Self {
            id,
            name,
            url,
            active,
            rate,
            slots,
            headers,
            strict_mode,
            insecure,
            signature_check,
            age,
            ignore_patterns,
            client_cert_public,
            client_cert_private,
            client_cert_passphrase,
            status,
            checksum_ack,
            checksum_updated,
            used_slots: 0,
            feeds: Vec::new(),
            limiter,
            client: None,
        }
    }

    /// A changed source content has not been acknowledged yet.
    pub(crate) fn attention(&self) -> bool {
        self.checksum_ack < self.checksum_updated
    }

    /// Concurrent download cap of this source: the minimum of the global
    /// slot count, the configured per-source maximum (when set) and the
    /// source's own override (when set).
    pub(crate) fn effective_slots(&self, cfg: &SourcesConfig) -> usize {
        let mut max = cfg.download_slots;
        if cfg.max_slots_per_source > 0 {
            max = max.min(cfg.max_slots_per_source);
        }
        if let Some(own) = self.slots {
            max = max.min(own);
        }
        max
    }

    pub(crate) fn strict_mode_effective(&self, cfg: &SourcesConfig) -> bool {
        self.strict_mode.unwrap_or(cfg.strict_mode)
    }

    pub(crate) fn insecure_effective(&self, cfg: &SourcesConfig) -> bool {
        self.insecure.unwrap_or(!cfg.secure)
    }

    pub(crate) fn signature_check_effective(&self, cfg: &SourcesConfig) -> bool {
        self.signature_check.unwrap_or(cfg.signature_check)
    }

    /// Replace the rate limiter when the rate changes.
    pub(crate) fn set_rate(&mut self, rate: Option<f64>) {
        self.rate = rate;
        self.limiter = make_limiter(rate);
    }

    pub(crate) fn limiter(&self) -> Option<Arc<DefaultDirectRateLimiter>> {
        self.limiter.clone()
    }

    /// Whether any part of a client certificate is configured.
    pub(crate) fn has_client_cert(&self) -> bool {
        self.client_cert_public.is_some()
            || self.client_cert_private.is_some()
            || self.client_cert_passphrase.is_some()
    }

    /// Whether a URL matches one of the ignore patterns.
    pub(crate) fn ignores(&self, url: &str) -> bool {
        self.ignore_patterns.iter().any(|p| p.is_match(url))
    }

    /// Forget the cached HTTP client; the next use rebuilds it.
    pub(crate) fn invalidate_client(&mut self) {
        self.client = None;
    }

    /// Rebuild the HTTP client from the current settings. Fails when the
    /// client certificate cannot be turned into a TLS identity.
    pub(crate) fn update_client(&mut self, cfg: &SourcesConfig) -> Result<(), ClientError> {
        self.client = None;
        let client = self.build_client(cfg)?;
        self.client = Some(Arc::new(client));
        Ok(())
    }

    /// Cached client, built on first use.
    pub(crate) fn ensure_client(
        &mut self,
        cfg: &SourcesConfig,
    ) -> Result<Arc<reqwest::Client>, ClientError> {
        if self.client.is_none() {
            self.update_client(cfg)?;
        }
        Ok(self.client.clone().expect("client was just built"))
    }

    fn build_client(&self, cfg: &SourcesConfig) -> Result<reqwest::Client, ClientError> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .use_rustls_tls();
        if !self.headers.is_empty() {
            builder = builder.default_headers(parse_headers(&self.headers)?);
        }
        if self.insecure_effective(cfg) {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if self.has_client_cert() {
            builder = builder.identity(self.derive_identity()?);
        }
        builder.build().map_err(ClientError::Build)
    }

    /// Turn the stored certificate material into a TLS identity.
    fn derive_identity(&self) -> Result<reqwest::Identity, ClientError> {
        let public = self
            .client_cert_public
            .as_deref()
            .ok_or(ClientError::MissingPart("public part"))?;
        let private = self
            .client_cert_private
            .as_deref()
            .ok_or(ClientError::MissingPart("private part"))?;
        let key_pem = match &self.client_cert_passphrase {
            Some(passphrase) => decrypt_private_key(private, passphrase)?,
            None => private.to_vec(),
        };
        let mut bundle = key_pem;
        bundle.push(b'\n');
        bundle.extend_from_slice(public);
        reqwest::Identity::from_pem(&bundle).map_err(ClientError::Identity)
    }

    pub(crate) fn add_stats(&self, stats: &mut Stats) {
        for feed in &self.feeds {
            feed.add_stats(stats);
        }
    }
}

fn make_limiter(rate: Option<f64>) -> Option<Arc<DefaultDirectRateLimiter>> {
    let rate = rate.filter(|r| *r > 0.0)?;
    let period = Duration::from_secs_f64(1.0 / rate);
    let quota = Quota::with_period(period)?;
    Some(Arc::new(RateLimiter::direct(quota)))
}

fn parse_headers(headers: &[String]) -> Result<HeaderMap, ClientError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let Some((key, value)) = header.split_once(':') else {
            return Err(ClientError::Header(header.clone()));
        };
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|_| ClientError::Header(header.clone()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ClientError::Header(header.clone()))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Decrypt a passphrase-protected PKCS#8 private key, re-encoding it as
/// an unencrypted PEM block.
fn decrypt_private_key(private: &[u8], passphrase: &[u8]) -> Result<Vec<u8>, ClientError> {
    let blocks = pem::parse_many(private)?;
    for block in &blocks {
        if block.tag() != "ENCRYPTED PRIVATE KEY" {
            continue;
        }
        let info = pkcs8::EncryptedPrivateKeyInfo::try_from(block.contents())
            .map_err(|err| ClientError::Pkcs8(err.to_string()))?;
        let document = info
            .decrypt(passphrase)
            .map_err(|err| ClientError::Pkcs8(err.to_string()))?;
        let out = pem::encode(&pem::Pem::new("PRIVATE KEY", document.as_bytes().to_vec()));
        return Ok(out.into_bytes());
    }
    Err(ClientError::NotEncrypted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Source {
        Source::new(
            1,
            "example".to_string(),
            "https://example.com/pmd.json".to_string(),
            true,
            None,
            None,
            Vec::new(),
            None,
            None,
            None,
            None,
            Vec::new(),
            None,
            None,
            None,
            Vec::new(),
            OffsetDateTime::UNIX_EPOCH,
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    fn cfg() -> SourcesConfig {
        SourcesConfig {
            download_slots: 10,
            max_slots_per_source: 5,
            ..SourcesConfig::default()
        }
    }

    #[test]
    fn effective_slots_take_the_minimum() {
        let cfg = cfg();
        let mut s = source();
        assert_eq!(s.effective_slots(&cfg), 5);
        s.slots = Some(2);
        assert_eq!(s.effective_slots(&cfg), 2);
        s.slots = Some(100);
        assert_eq!(s.effective_slots(&cfg), 5);
    }

    #[test]
    fn unlimited_per_source_cap_falls_back_to_global() {
        let cfg = SourcesConfig {
            download_slots: 7,
            max_slots_per_source: 0,
            ..SourcesConfig::default()
        };
        assert_eq!(source().effective_slots(&cfg), 7);
    }

    #[test]
    fn limiter_only_for_positive_rates() {
        let mut s = source();
        assert!(s.limiter().is_none());
        s.set_rate(Some(2.0));
        assert!(s.limiter().is_some());
        s.set_rate(None);
        assert!(s.limiter().is_none());
    }

    #[test]
    fn tri_state_defaults_inherit() {
        let cfg = SourcesConfig {
            strict_mode: true,
            secure: true,
            signature_check: false,
            ..SourcesConfig::default()
        };
        let mut s = source();
        assert!(s.strict_mode_effective(&cfg));
        assert!(!s.insecure_effective(&cfg));
        assert!(!s.signature_check_effective(&cfg));
        s.strict_mode = Some(false);
        s.insecure = Some(true);
        s.signature_check = Some(true);
        assert!(!s.strict_mode_effective(&cfg));
        assert!(s.insecure_effective(&cfg));
        assert!(s.signature_check_effective(&cfg));
    }

    #[test]
    fn attention_follows_checksums() {
        let mut s = source();
        assert!(!s.attention());
        s.checksum_updated = s.checksum_ack + time::Duration::seconds(1);
        assert!(s.attention());
    }

    #[test]
    fn bad_cert_material_fails_derivation() {
        let mut s = source();
        s.client_cert_public =
            Some(b"-----BEGIN CERTIFICATE-----\nAQID\n-----END CERTIFICATE-----\n".to_vec());
        s.client_cert_private = Some(b"garbage, not a key".to_vec());
        assert!(s.update_client(&cfg()).is_err());
    }

    #[test]
    fn missing_private_part_fails_derivation() {
        let mut s = source();
        s.client_cert_public =
            Some(b"-----BEGIN CERTIFICATE-----\nAQID\n-----END CERTIFICATE-----\n".to_vec());
        assert!(matches!(
            s.update_client(&cfg()),
            Err(ClientError::MissingPart("private part"))
        ));
    }

    #[test]
    fn ignore_patterns_match() {
        let mut s = source();
        s.ignore_patterns = vec![Regex::new(r"\.asc$").unwrap()];
        assert!(s.ignores("https://example.com/doc.json.asc"));
        assert!(!s.ignores("https://example.com/doc.json"));
    }

    #[test]
    fn header_parsing() {
        let map = parse_headers(&["X-Auth: token".to_string(), "Accept: json".to_string()]).unwrap();
        assert_eq!(map.len(), 2);
        assert!(parse_headers(&["bad header".to_string()]).is_err());
    }
}
