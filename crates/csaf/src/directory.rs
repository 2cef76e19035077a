//! Directory-indexed feeds.
//!
//! Directory distributions publish a `changes.csv` next to the advisory
//! tree: one line per document, path first, RFC 3339 timestamp second,
//! newest first.

use crate::DiscoveredLocation;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;

/// Where the change index of a directory feed lives.
pub fn changes_url(feed_url: &Url) -> Option<Url> {
    feed_url.join("changes.csv").ok()
}

/// Parse a `changes.csv` document into locations relative to `base`.
/// Unparsable lines are collected as problems instead of aborting the
/// whole refresh.
pub fn parse_changes(base: &Url, data: &str) -> (Vec<DiscoveredLocation>, Vec<String>) {
    let mut out = Vec::new();
    let mut problems = Vec::new();
    for (no, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((path, time)) = split_record(line) else {
            problems.push(format!("line {}: expected two fields", no + 1));
            continue;
        };
        let url = match base.join(&path) {
            Ok(u) => u,
            Err(err) => {
                problems.push(format!("line {}: bad path {path:?}: {err}", no + 1));
                continue;
            }
        };
        let changed = match OffsetDateTime::parse(&time, &Rfc3339) {
            Ok(t) => Some(t),
            Err(_) => {
                problems.push(format!("line {}: bad timestamp {time:?}", no + 1));
                None
            }
        };
        out.push(DiscoveredLocation {
            url,
            changed,
            hashes: Vec::new(),
            signature: None,
        });
    }
    (out, problems)
}

/// Split one CSV record into (path, timestamp), handling optional quoting.
fn split_record(line: &str) -> Option<(String, String)> {
    let fields: Vec<String> = if line.starts_with('"') {
        // Quoted form: "path","timestamp"
        let mut fields = Vec::new();
        let mut rest = line;
        while rest.starts_with('"') {
            let inner = &rest[1..];
            let end = inner.find('"')?;
            fields.push(inner[..end].to_string());
            rest = inner[end + 1..].trim_start_matches(',');
        }
        fields
    } else {
        line.split(',').map(|f| f.trim().to_string()).collect()
    };
    if fields.len() != 2 {
        return None;
    }
    Some((fields[0].clone(), fields[1].clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        "https://example.com/csaf/white/".parse().unwrap()
    }

    #[test]
    fn changes_url_is_relative_to_directory() {
        assert_eq!(
            changes_url(&base()).unwrap().as_str(),
            "https://example.com/csaf/white/changes.csv"
        );
    }

    #[test]
    fn parses_quoted_and_bare_records() {
        let data = "\"2024/exa-2024-0001.json\",\"2024-02-01T10:00:00Z\"\n\
                    2023/exa-2023-0007.json,2023-12-24T00:00:00Z\n";
        let (locs, problems) = parse_changes(&base(), data);
        assert!(problems.is_empty());
        assert_eq!(locs.len(), 2);
        assert_eq!(
            locs[0].url.as_str(),
            "https://example.com/csaf/white/2024/exa-2024-0001.json"
        );
        assert!(locs[0].changed.is_some());
    }

    #[test]
    fn collects_problems_per_line() {
        let data = "only-one-field\n\
                    2024/a.json,not-a-time\n\
                    \n";
        let (locs, problems) = parse_changes(&base(), data);
        // Bad timestamp still yields a location, just without a change time.
        assert_eq!(locs.len(), 1);
        assert!(locs[0].changed.is_none());
        assert_eq!(problems.len(), 2);
    }
}
