//! Feeds and their download queues.

use crate::api::Stats;
use scythe_core::loglevel::FeedLogLevel;
use scythe_csaf::{DiscoveredLocation, directory, rolie};
use scythe_db::Database;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use time::OffsetDateTime;
use url::Url;

/// A feed's log level as an atomic scalar, readable by download workers
/// without going through the command loop.
pub(crate) struct LevelCell(AtomicU8);

impl LevelCell {
    pub(crate) fn new(level: FeedLogLevel) -> Self {
        Self(AtomicU8::new(level.as_u8()))
    }

    pub(crate) fn load(&self) -> FeedLogLevel {
        FeedLogLevel::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn store(&self, level: FeedLogLevel) {
        self.0.store(level.as_u8(), Ordering::Relaxed);
    }
}

/// Download state of a queued location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LocationState {
    Waiting,
    Running,
    Done,
}

/// A candidate advisory queued for download.
#[derive(Clone, Debug)]
pub(crate) struct Location {
    /// Scheduler id, unique per manager lifetime. 0 until dispatched.
    pub id: u64,
    pub url: Url,
    pub discovered: OffsetDateTime,
    pub hashes: Vec<Url>,
    pub signature: Option<Url>,
    pub state: LocationState,
}

impl Location {
    pub(crate) fn from_discovered(loc: DiscoveredLocation) -> Self {
        Self {
            id: 0,
            url: loc.url,
            discovered: loc.changed.unwrap_or_else(OffsetDateTime::now_utc),
            hashes: loc.hashes,
            signature: loc.signature,
            state: LocationState::Waiting,
        }
    }
}

/// A fetchable listing belonging to exactly one source.
pub(crate) struct Feed {
    pub id: i64,
    pub source_id: i64,
    pub label: String,
    pub url: Url,
    pub rolie: bool,
    pub log_level: Arc<LevelCell>,
    /// Soft-delete marker, readable by workers.
    pub invalid: Arc<AtomicBool>,
    /// `None` means "never checked": the next pass refreshes.
    pub next_check: Option<OffsetDateTime>,
    pub queue: Vec<Location>,
}

impl Feed {
    pub(crate) fn new(
        id: i64,
        source_id: i64,
        label: String,
        url: Url,
        rolie: bool,
        log_level: FeedLogLevel,
    ) -> Self {
        Self {
            id,
            source_id,
            label,
            url,
            rolie,
            log_level: Arc::new(LevelCell::new(log_level)),
            invalid: Arc::new(AtomicBool::new(false)),
            next_check: None,
            queue: Vec::new(),
        }
    }

    /// Whether the refresh scheduler owes this feed a pass.
    pub(crate) fn needs_refresh(&self, now: OffsetDateTime) -> bool {
        match self.next_check {
            None => true,
            Some(next) => next <= now,
        }
    }

    /// First waiting location in queue order.
    pub(crate) fn find_waiting(&mut self) -> Option<&mut Location> {
        self.queue
            .iter_mut()
            .find(|l| l.state == LocationState::Waiting)
    }

    /// Find a running location by its scheduler id.
    pub(crate) fn find_by_scheduler_id(&mut self, id: u64) -> Option<&mut Location> {
        self.queue.iter_mut().find(|l| l.id == id)
    }

    /// Whether a URL is already queued (in any state).
    pub(crate) fn knows_url(&self, url: &Url) -> bool {
        self.queue.iter().any(|l| &l.url == url)
    }

    /// Drop finished locations.
    pub(crate) fn compact_done(&mut self) {
        self.queue.retain(|l| l.state != LocationState::Done);
    }

    pub(crate) fn add_stats(&self, stats: &mut Stats) {
        for location in &self.queue {
            match location.state {
                LocationState::Running => stats.downloading += 1,
                LocationState::Waiting => stats.waiting += 1,
                LocationState::Done => {}
            }
        }
    }
}

/// Write a feed log entry if it passes the feed's level, mirroring it to
/// the tracing output.
pub(crate) async fn log_feed(
    db: &Database,
    feed_id: i64,
    cell: &LevelCell,
    level: FeedLogLevel,
    message: String,
) {
    tracing::debug!(feed = feed_id, %level, %message, "feed log");
    if level < cell.load() {
        return;
    }
    const SQL: &str = "INSERT INTO feed_logs (feeds_id, lvl, msg) \
                       VALUES ($1, $2::feed_logs_level, $3)";
    let result = db
        .run(
            |conn| {
                let message = message.clone();
                Box::pin(async move {
                    sqlx::query(SQL)
                        .bind(feed_id)
                        .bind(level.as_str())
                        .bind(message)
                        .execute(conn)
                        .await
                        .map(|_| ())
                })
            },
            0,
        )
        .await;
    if let Err(err) = result {
        tracing::error!(feed = feed_id, error = %err, "writing feed log failed");
    }
}

/// Fetch a feed listing and turn it into candidate locations. Problems of
/// individual entries come back alongside the candidates; a failure of
/// the listing itself is the error case.
pub(crate) async fn fetch_listing(
    client: &reqwest::Client,
    url: &Url,
    rolie: bool,
) -> Result<(Vec<DiscoveredLocation>, Vec<String>), String> {
    if rolie {
        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| format!("fetching ROLIE feed failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("fetching ROLIE feed failed: status {}", response.status()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| format!("reading ROLIE feed failed: {err}"))?;
        rolie::parse_locations(&body).map_err(|err| format!("parsing ROLIE feed failed: {err}"))
    } else {
        let changes = directory::changes_url(url)
            .ok_or_else(|| format!("cannot derive changes.csv from {url}"))?;
        let response = client
            .get(changes)
            .send()
            .await
            .map_err(|err| format!("fetching changes.csv failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("fetching changes.csv failed: status {}", response.status()));
        }
        let body = response
            .text()
            .await
            .map_err(|err| format!("reading changes.csv failed: {err}"))?;
        Ok(directory::parse_changes(url, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> Feed {
        Feed::new(
            1,
            1,
            "white".to_string(),
            "https://example.com/feed.json".parse().unwrap(),
            true,
            FeedLogLevel::Info,
        )
    }

    fn location(url: &str, state: LocationState) -> Location {
        Location {
            id: 0,
            url: url.parse().unwrap(),
            discovered: OffsetDateTime::now_utc(),
            hashes: Vec::new(),
            signature: None,
            state,
        }
    }

    #[test]
    fn waiting_is_picked_in_queue_order() {
        let mut f = feed();
        f.queue.push(location("https://example.com/a.json", LocationState::Running));
        f.queue.push(location("https://example.com/b.json", LocationState::Waiting));
        f.queue.push(location("https://example.com/c.json", LocationState::Waiting));
        let next = f.find_waiting().unwrap();
        assert_eq!(next.url.as_str(), "https://example.com/b.json");
    }

    #[test]
    fn compaction_removes_only_done() {
        let mut f = feed();
        f.queue.push(location("https://example.com/a.json", LocationState::Done));
        f.queue.push(location("https://example.com/b.json", LocationState::Running));
        f.queue.push(location("https://example.com/c.json", LocationState::Waiting));
        f.compact_done();
        assert_eq!(f.queue.len(), 2);
        assert!(f.queue.iter().all(|l| l.state != LocationState::Done));
    }

    #[test]
    fn stats_count_by_state() {
        let mut f = feed();
        f.queue.push(location("https://example.com/a.json", LocationState::Running));
        f.queue.push(location("https://example.com/b.json", LocationState::Waiting));
        f.queue.push(location("https://example.com/c.json", LocationState::Waiting));
        f.queue.push(location("https://example.com/d.json", LocationState::Done));
        let mut stats = Stats::default();
        f.add_stats(&mut stats);
        assert_eq!(stats.downloading, 1);
        assert_eq!(stats.waiting, 2);
    }

    #[test]
    fn refresh_due_when_never_checked() {
        let mut f = feed();
        let now = OffsetDateTime::now_utc();
        assert!(f.needs_refresh(now));
        f.next_check = Some(now + time::Duration::minutes(5));
        assert!(!f.needs_refresh(now));
        f.next_check = Some(now - time::Duration::seconds(1));
        assert!(f.needs_refresh(now));
    }

    #[test]
    fn level_cell_roundtrip() {
        let cell = LevelCell::new(FeedLogLevel::Warn);
        assert_eq!(cell.load(), FeedLogLevel::Warn);
        cell.store(FeedLogLevel::Debug);
        assert_eq!(cell.load(), FeedLogLevel::Debug);
    }
}
