//! Provider OpenPGP keyrings.
//!
//! Providers advertise the keys their advisories are signed with inside
//! the PMD. The manager caches loaded keyrings; this module only fetches,
//! parses and verifies.

use crate::error::{CsafError, CsafResult};
use crate::pmd::ProviderMetadata;
use async_trait::async_trait;
use pgp::composed::{Deserializable, SignedPublicKey, StandaloneSignature};
use std::time::Duration;

/// Timeout for a single key fetch.
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// A set of public keys belonging to one provider.
#[derive(Debug, Default)]
pub struct Keyring {
    keys: Vec<SignedPublicKey>,
}

impl Keyring {
    /// A keyring without any keys. Verification always fails against it.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse one armored blob which may contain several keys.
    pub fn parse_armored(data: &str) -> CsafResult<Vec<SignedPublicKey>> {
        let (keys, _headers) = SignedPublicKey::from_string_many(data)?;
        let mut out = Vec::new();
        for key in keys {
            out.push(key?);
        }
        Ok(out)
    }

    /// Add keys to the ring.
    pub fn extend(&mut self, keys: Vec<SignedPublicKey>) {
        self.keys.extend(keys);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify an armored detached signature over `data` against any key
    /// (or subkey) in the ring.
    pub fn verify_detached(&self, data: &[u8], signature: &str) -> CsafResult<()> {
        let (sig, _headers) = StandaloneSignature::from_string(signature)?;
        for key in &self.keys {
            if sig.verify(key, data).is_ok() {
                return Ok(());
            }
            for sub in &key.public_subkeys {
                if sig.verify(sub, data).is_ok() {
                    return Ok(());
                }
            }
        }
        Err(CsafError::BadSignature)
    }
}

/// Port for loading a provider's keyring. The TTL cache lives with the
/// source manager.
#[async_trait]
pub trait KeysLoader: Send + Sync {
    /// Load every usable key the PMD advertises. Individual fetch or
    /// parse failures shrink the ring instead of failing the load.
    async fn load(&self, pmd: &ProviderMetadata) -> Keyring;
}

/// HTTP implementation of [`KeysLoader`].
pub struct HttpKeysLoader {
    client: reqwest::Client,
}

impl HttpKeysLoader {
    pub fn new() -> CsafResult<Self> {
        let client = reqwest::Client::builder().timeout(LOAD_TIMEOUT).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_armored(&self, url: &url::Url) -> CsafResult<String> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(CsafError::Status {
                url: url.clone(),
                status: response.status(),
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl KeysLoader for HttpKeysLoader {
    async fn load(&self, pmd: &ProviderMetadata) -> Keyring {
        let mut ring = Keyring::empty();
        for entry in &pmd.public_openpgp_keys {
            let armored = match self.fetch_armored(&entry.url).await {
                Ok(a) => a,
                Err(err) => {
                    tracing::warn!(url = %entry.url, error = %err, "fetching OpenPGP key failed");
                    continue;
                }
            };
            match Keyring::parse_armored(&armored) {
                Ok(keys) => ring.extend(keys),
                Err(err) => {
                    tracing::warn!(url = %entry.url, error = %err, "parsing OpenPGP key failed");
                }
            }
        }
        ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_rejects() {
        let ring = Keyring::empty();
        assert!(ring.is_empty());
        assert!(matches!(
            ring.verify_detached(b"data", "not a signature"),
            Err(CsafError::Pgp(_))
        ));
    }

    #[test]
    fn garbage_is_not_a_keyring() {
        assert!(Keyring::parse_armored("definitely not armored").is_err());
    }

    #[tokio::test]
    async fn loader_tolerates_unreachable_keys() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/key.asc");
                then.status(404);
            })
            .await;
        let pmd: ProviderMetadata = serde_json::from_value(serde_json::json!({
            "canonical_url": "https://example.com/pmd.json",
            "public_openpgp_keys": [ { "url": server.url("/key.asc") } ]
        }))
        .unwrap();
        let loader = HttpKeysLoader::new().unwrap();
        let ring = loader.load(&pmd).await;
        assert!(ring.is_empty());
    }
}
