//! ROLIE feed documents.
//!
//! A ROLIE feed lists advisories as Atom-style entries. Each entry points
//! at the document itself (`content.src` or the `self` link) and may
//! advertise checksum (`hash`) and detached signature (`signature`) links.

use crate::error::{CsafError, CsafResult};
use crate::DiscoveredLocation;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;

/// Top-level ROLIE document.
#[derive(Debug, Deserialize)]
pub struct RolieDocument {
    pub feed: RolieFeed,
}

/// The feed body.
#[derive(Debug, Deserialize)]
pub struct RolieFeed {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub entry: Vec<RolieEntry>,
}

/// A single feed entry.
#[derive(Debug, Deserialize)]
pub struct RolieEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub content: Option<RolieContent>,
    #[serde(default)]
    pub link: Vec<RolieLink>,
}

/// The `content` element of an entry.
#[derive(Debug, Deserialize)]
pub struct RolieContent {
    #[serde(default)]
    pub src: Option<Url>,
    #[serde(default, rename = "type")]
    pub content_type: Option<String>,
}

/// A typed link of an entry.
#[derive(Debug, Deserialize)]
pub struct RolieLink {
    pub rel: String,
    pub href: Url,
}

/// Parse a ROLIE feed document.
pub fn parse(data: &[u8]) -> CsafResult<RolieDocument> {
    Ok(serde_json::from_slice(data)?)
}

impl RolieEntry {
    /// The advisory URL of this entry: `content.src` wins, the `self`
    /// link is the fallback.
    fn document_url(&self) -> Option<&Url> {
        if let Some(content) = &self.content
            && let Some(src) = &content.src
        {
            return Some(src);
        }
        self.link.iter().find(|l| l.rel == "self").map(|l| &l.href)
    }

    fn changed(&self) -> Option<OffsetDateTime> {
        let raw = self.updated.as_deref().or(self.published.as_deref())?;
        OffsetDateTime::parse(raw, &Rfc3339).ok()
    }
}

/// Extract the candidate locations of a parsed feed. Entries without a
/// resolvable document URL are reported in the second component.
pub fn locations(doc: &RolieDocument) -> (Vec<DiscoveredLocation>, Vec<String>) {
    let mut out = Vec::with_capacity(doc.feed.entry.len());
    let mut problems = Vec::new();
    for entry in &doc.feed.entry {
        let Some(url) = entry.document_url() else {
            problems.push(format!(
                "entry {} has no document URL",
                entry.id.as_deref().unwrap_or("<unnamed>")
            ));
            continue;
        };
        out.push(DiscoveredLocation {
            url: url.clone(),
            changed: entry.changed(),
            hashes: entry
                .link
                .iter()
                .filter(|l| l.rel == "hash")
                .map(|l| l.href.clone())
                .collect(),
            signature: entry
                .link
                .iter()
                .find(|l| l.rel == "signature")
                .map(|l| l.href.clone()),
        });
    }
    (out, problems)
}

/// Parse and extract in one step, failing only on malformed JSON.
pub fn parse_locations(data: &[u8]) -> CsafResult<(Vec<DiscoveredLocation>, Vec<String>)> {
    let doc = parse(data)?;
    if doc.feed.entry.is_empty() && doc.feed.id.is_none() && doc.feed.title.is_none() {
        return Err(CsafError::Malformed("feed has no entries and no identity".to_string()));
    }
    Ok(locations(&doc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "feed": {
            "id": "example-csaf-feed-tlp-white",
            "title": "Example CSAF feed (TLP:WHITE)",
            "entry": [
                {
                    "id": "EXA-2024-0001",
                    "updated": "2024-02-01T10:00:00Z",
                    "content": {
                        "src": "https://example.com/csaf/2024/exa-2024-0001.json",
                        "type": "application/json"
                    },
                    "link": [
                        { "rel": "self", "href": "https://example.com/csaf/2024/exa-2024-0001.json" },
                        { "rel": "hash", "href": "https://example.com/csaf/2024/exa-2024-0001.json.sha512" },
                        { "rel": "signature", "href": "https://example.com/csaf/2024/exa-2024-0001.json.asc" }
                    ]
                },
                {
                    "id": "EXA-2024-0002",
                    "updated": "not a timestamp",
                    "link": [
                        { "rel": "self", "href": "https://example.com/csaf/2024/exa-2024-0002.json" }
                    ]
                },
                {
                    "id": "EXA-2024-0003",
                    "link": [ { "rel": "hash", "href": "https://example.com/nowhere.sha256" } ]
                }
            ]
        }
    }"#;

    #[test]
    fn extracts_locations() {
        let (locs, problems) = parse_locations(SAMPLE.as_bytes()).unwrap();
        assert_eq!(locs.len(), 2);
        assert_eq!(problems.len(), 1);

        let first = &locs[0];
        assert_eq!(
            first.url.as_str(),
            "https://example.com/csaf/2024/exa-2024-0001.json"
        );
        assert!(first.changed.is_some());
        assert_eq!(first.hashes.len(), 1);
        assert!(first.signature.is_some());

        // Entry two: self link fallback, unparseable timestamp dropped.
        let second = &locs[1];
        assert_eq!(
            second.url.as_str(),
            "https://example.com/csaf/2024/exa-2024-0002.json"
        );
        assert!(second.changed.is_none());
    }

    #[test]
    fn rejects_non_feed_json() {
        assert!(parse_locations(br#"{"feed": {}}"#).is_err());
        assert!(parse_locations(b"[1,2,3]").is_err());
    }
}
