//! Provider-metadata documents (PMD).
//!
//! A PMD describes where a CSAF provider publishes advisories: ROLIE
//! feeds, plain directory listings, and the OpenPGP keys signing them.
//! Loading never fails hard; the result always comes back as a
//! [`LoadedProviderMetadata`] whose `messages` explain what went wrong.

use crate::error::CsafResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Timeout for a single PMD fetch.
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// A distribution entry: either a directory tree or a ROLIE section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolie: Option<Rolie>,
}

/// The ROLIE section of a distribution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rolie {
    #[serde(default)]
    pub feeds: Vec<RolieFeedRef>,
}

/// A single ROLIE feed reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolieFeedRef {
    pub url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlp_label: Option<String>,
}

/// An OpenPGP key advertised by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgpKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub url: Url,
}

/// The provider-metadata document, reduced to the fields the manager uses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub canonical_url: Url,
    #[serde(default)]
    pub distributions: Vec<Distribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_version: Option<String>,
    #[serde(default)]
    pub public_openpgp_keys: Vec<PgpKey>,
}

impl ProviderMetadata {
    /// All ROLIE feed URLs across distributions.
    pub fn rolie_feed_urls(&self) -> impl Iterator<Item = &Url> {
        self.distributions
            .iter()
            .filter_map(|d| d.rolie.as_ref())
            .flat_map(|r| r.feeds.iter())
            .map(|f| &f.url)
    }

    /// All directory URLs across distributions.
    pub fn directory_urls(&self) -> impl Iterator<Item = &Url> {
        self.distributions.iter().filter_map(|d| d.directory_url.as_ref())
    }
}

/// Classify a candidate feed URL as one of the PMD's ROLIE feeds.
pub fn is_rolie_feed(pmd: &ProviderMetadata, url: &Url) -> bool {
    pmd.rolie_feed_urls().any(|u| u == url)
}

/// Classify a candidate feed URL as living under one of the PMD's
/// directory trees.
pub fn is_directory_feed(pmd: &ProviderMetadata, url: &Url) -> bool {
    pmd.directory_urls()
        .any(|dir| url == dir || url.as_str().starts_with(dir.as_str()))
}

/// Result of loading a PMD: the parsed document, the raw JSON for
/// front-end pass-through, and any load problems.
#[derive(Clone, Debug)]
pub struct LoadedProviderMetadata {
    pub url: String,
    pub document: Option<ProviderMetadata>,
    pub raw: Option<serde_json::Value>,
    pub messages: Vec<String>,
}

impl LoadedProviderMetadata {
    /// Whether a usable document was loaded.
    pub fn is_valid(&self) -> bool {
        self.document.is_some()
    }

    fn failed(url: &str, message: String) -> Self {
        Self {
            url: url.to_string(),
            document: None,
            raw: None,
            messages: vec![message],
        }
    }
}

/// Port for loading provider metadata. The TTL cache and coalescing live
/// with the source manager; implementations only fetch.
#[async_trait]
pub trait PmdLoader: Send + Sync {
    async fn load(&self, url: &str) -> LoadedProviderMetadata;
}

/// HTTP implementation of [`PmdLoader`].
pub struct HttpPmdLoader {
    client: reqwest::Client,
}

impl HttpPmdLoader {
    pub fn new() -> CsafResult<Self> {
        let client = reqwest::Client::builder().timeout(LOAD_TIMEOUT).build()?;
        Ok(Self { client })
    }

    /// Use a pre-built client (tests, custom TLS setups).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PmdLoader for HttpPmdLoader {
    async fn load(&self, url: &str) -> LoadedProviderMetadata {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(err) => {
                return LoadedProviderMetadata::failed(url, format!("invalid URL: {err}"));
            }
        };
        let response = match self.client.get(parsed).send().await {
            Ok(r) => r,
            Err(err) => {
                return LoadedProviderMetadata::failed(url, format!("fetching PMD failed: {err}"));
            }
        };
        if !response.status().is_success() {
            return LoadedProviderMetadata::failed(
                url,
                format!("fetching PMD failed: status {}", response.status()),
            );
        }
        let raw: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(err) => {
                return LoadedProviderMetadata::failed(url, format!("PMD is not JSON: {err}"));
            }
        };
        match serde_json::from_value::<ProviderMetadata>(raw.clone()) {
            Ok(document) => LoadedProviderMetadata {
                url: url.to_string(),
                document: Some(document),
                raw: Some(raw),
                messages: Vec::new(),
            },
            Err(err) => LoadedProviderMetadata {
                url: url.to_string(),
                document: None,
                raw: Some(raw),
                messages: vec![format!("PMD does not match the schema: {err}")],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "canonical_url": "https://example.com/.well-known/csaf/provider-metadata.json",
        "last_updated": "2024-03-01T00:00:00Z",
        "metadata_version": "2.0",
        "distributions": [
            {
                "rolie": {
                    "feeds": [
                        {
                            "summary": "TLP:WHITE advisories",
                            "tlp_label": "WHITE",
                            "url": "https://example.com/csaf/feed-tlp-white.json"
                        }
                    ]
                }
            },
            { "directory_url": "https://example.com/csaf/white/" }
        ],
        "public_openpgp_keys": [
            { "fingerprint": "DEADBEEF", "url": "https://example.com/key.asc" }
        ]
    }"#;

    fn sample() -> ProviderMetadata {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn parses_sample() {
        let pmd = sample();
        assert_eq!(pmd.rolie_feed_urls().count(), 1);
        assert_eq!(pmd.directory_urls().count(), 1);
        assert_eq!(pmd.public_openpgp_keys.len(), 1);
    }

    #[test]
    fn classifies_feeds() {
        let pmd = sample();
        let rolie: Url = "https://example.com/csaf/feed-tlp-white.json".parse().unwrap();
        let dir: Url = "https://example.com/csaf/white/2024/".parse().unwrap();
        let other: Url = "https://elsewhere.example/feed.json".parse().unwrap();
        assert!(is_rolie_feed(&pmd, &rolie));
        assert!(!is_rolie_feed(&pmd, &dir));
        assert!(is_directory_feed(&pmd, &dir));
        assert!(!is_directory_feed(&pmd, &other));
    }

    #[tokio::test]
    async fn loader_reports_bad_url() {
        let loader = HttpPmdLoader::new().unwrap();
        let loaded = loader.load("not a url").await;
        assert!(!loaded.is_valid());
        assert!(loaded.messages[0].contains("invalid URL"));
    }

    #[tokio::test]
    async fn loader_fetches_document() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/pmd.json");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(SAMPLE);
            })
            .await;
        let loader = HttpPmdLoader::new().unwrap();
        let loaded = loader.load(&server.url("/pmd.json")).await;
        mock.assert_async().await;
        assert!(loaded.is_valid());
        assert!(loaded.raw.is_some());
    }

    #[tokio::test]
    async fn loader_keeps_raw_on_schema_mismatch() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/pmd.json");
                then.status(200).body(r#"{"not": "a pmd"}"#);
            })
            .await;
        let loader = HttpPmdLoader::new().unwrap();
        let loaded = loader.load(&server.url("/pmd.json")).await;
        assert!(!loaded.is_valid());
        assert!(loaded.raw.is_some());
        assert_eq!(loaded.messages.len(), 1);
    }
}
