//! The manager task and its public handle.
//!
//! [`Manager::run`] is the command loop: the single writer over the
//! catalogue. [`SourceManager`] is the cloneable handle the rest of the
//! daemon talks to; every operation posts a closure onto the command
//! channel and reads its reply over a oneshot channel.

use crate::api::{
    AddSourceRequest, AttentionSource, FeedInfo, FeedLogEntry, FeedLogQuery, SourceInfo,
    SourceSubscriptions, SourceUpdateOutcome, Stats, as_regexps, check_age, has_pem_block,
    normalize_rate, normalize_slots, validate_headers,
};
use crate::download::{DownloadJob, Downloader, FeedContext};
use crate::error::Error;
use crate::feed::{Feed, Location, LocationState, fetch_listing, log_feed};
use crate::keys_cache::KeysCache;
use crate::pmd_cache::PmdCache;
use crate::source::Source;
use crate::updater::{FeedUpdater, SourceUpdater, build_update_sql, interval_from_duration};
use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use regex::Regex;
use scythe_core::DEACTIVATED_DUE_TO_CLIENT_CERT_ISSUE;
use scythe_core::config::SourcesConfig;
use scythe_core::crypto::CryptoBox;
use scythe_core::loglevel::FeedLogLevel;
use scythe_csaf::{
    DiscoveredLocation, DocumentStore, KeysLoader, LoadedProviderMetadata, PmdLoader,
    RemoteValidator, pmd,
};
use scythe_db::Database;
use sqlx::Row;
use sqlx::postgres::types::PgInterval;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use url::Url;

/// A closure executed by the command loop against the manager.
pub(crate) type Command = Box<dyn for<'a> FnOnce(&'a mut Manager) -> BoxFuture<'a, ()> + Send>;

/// Fallback interval between loop wake-ups for feed refresh checks.
const REFRESH_TICK: Duration = Duration::from_secs(60);

/// Capacity of the command channel.
const COMMAND_BACKLOG: usize = 64;

/// The single-writer owner of the source catalogue.
pub struct Manager {
    cfg: SourcesConfig,
    db: Database,
    crypto: CryptoBox,
    sources: Vec<Source>,
    pmd_cache: Arc<PmdCache>,
    keys_cache: Arc<KeysCache>,
    validator: Option<Arc<dyn RemoteValidator>>,
    store: Arc<dyn DocumentStore>,
    fns_tx: mpsc::Sender<Command>,
    fns_rx: mpsc::Receiver<Command>,
    jobs_tx: Option<mpsc::Sender<DownloadJob>>,
    jobs_rx: Option<mpsc::Receiver<DownloadJob>>,
    used_slots: usize,
    unique_id: u64,
    done: bool,
    last_log_prune: Option<Instant>,
}

impl Manager {
    /// Create a manager and its public handle.
    pub fn new(
        cfg: SourcesConfig,
        db: Database,
        pmd_loader: Arc<dyn PmdLoader>,
        keys_loader: Arc<dyn KeysLoader>,
        validator: Option<Arc<dyn RemoteValidator>>,
        store: Arc<dyn DocumentStore>,
    ) -> (Self, SourceManager) {
        let (fns_tx, fns_rx) = mpsc::channel(COMMAND_BACKLOG);
        let (jobs_tx, jobs_rx) = mpsc::channel(cfg.download_slots.max(1));
        let pmd_cache = Arc::new(PmdCache::new(pmd_loader));
        let keys_cache = Arc::new(KeysCache::new(
            keys_loader,
            pmd_cache.clone(),
            cfg.openpgp_caching(),
        ));
        let crypto = CryptoBox::new(&cfg.encryption_secret);
        let handle = SourceManager {
            tx: fns_tx.clone(),
            db: db.clone(),
            cfg: cfg.clone(),
            pmd_cache: pmd_cache.clone(),
        };
        let manager = Self {
            cfg,
            db,
            crypto,
            sources: Vec::new(),
            pmd_cache,
            keys_cache,
            validator,
            store,
            fns_tx,
            fns_rx,
            jobs_tx: Some(jobs_tx),
            jobs_rx: Some(jobs_rx),
            used_slots: 0,
            unique_id: 0,
            done: false,
            last_log_prune: None,
        };
        (manager, handle)
    }

    /// Load the catalogue from the database. Call before [`Manager::run`].
    pub async fn boot(&mut self) -> Result<(), Error> {
        const SOURCES_SQL: &str = "SELECT id, name, url, active, rate, slots, headers, \
             strict_mode, insecure, signature_check, age, ignore_patterns, \
             client_cert_public, client_cert_private, client_cert_passphrase, \
             status, checksum_ack, checksum_updated \
             FROM sources ORDER BY id";
        const FEEDS_SQL: &str =
            "SELECT id, label, sources_id, url, rolie, log_lvl::text AS log_lvl \
             FROM feeds ORDER BY id";

        let source_rows = self
            .db
            .run(
                |conn| Box::pin(async move { sqlx::query(SOURCES_SQL).fetch_all(conn).await }),
                0,
            )
            .await?;
        for row in source_rows {
            let id: i64 = row.get("id");
            let name: String = row.get("name");
            let patterns: Vec<String> = row.get("ignore_patterns");
            let mut compiled = Vec::with_capacity(patterns.len());
            for pattern in &patterns {
                match Regex::new(pattern) {
                    Ok(re) => compiled.push(re),
                    Err(err) => {
                        tracing::warn!(source = %name, pattern, error = %err, "dropping unparsable ignore pattern");
                    }
                }
            }
            let mut cert_issue = false;
            let private = match row.get::<Option<Vec<u8>>, _>("client_cert_private") {
                Some(encrypted) => match self.crypto.decrypt(&encrypted) {
                    Ok(plain) => Some(plain),
                    Err(err) => {
                        tracing::error!(source = %name, error = %err, "decrypting client cert private part failed");
                        cert_issue = true;
                        None
                    }
                },
                None => None,
            };
            let passphrase = match row.get::<Option<Vec<u8>>, _>("client_cert_passphrase") {
                Some(encrypted) => match self.crypto.decrypt(&encrypted) {
                    Ok(plain) => Some(plain),
                    Err(err) => {
                        tracing::error!(source = %name, error = %err, "decrypting client cert passphrase failed");
                        cert_issue = true;
                        None
                    }
                },
                None => None,
            };
            let mut source = Source::new(
                id,
                name,
                row.get("url"),
                row.get("active"),
                row.get("rate"),
                row.get::<Option<i32>, _>("slots").map(|s| s.max(0) as usize),
                row.get("headers"),
                row.get("strict_mode"),
                row.get("insecure"),
                row.get("signature_check"),
                row.get::<Option<PgInterval>, _>("age").map(duration_from_interval),
                compiled,
                row.get("client_cert_public"),
                private,
                passphrase,
                row.get("status"),
                row.get("checksum_ack"),
                row.get("checksum_updated"),
            );
            if !cert_issue && source.has_client_cert() {
                if let Err(err) = source.update_client(&self.cfg) {
                    tracing::warn!(source = %source.name, error = %err, "restoring client cert failed");
                    cert_issue = true;
                }
            }
            self.sources.push(source);
            if cert_issue {
                let si = self.sources.len() - 1;
                if self.sources[si].active {
                    self.persist_deactivation(si).await;
                } else {
                    self.sources[si].status =
                        vec![DEACTIVATED_DUE_TO_CLIENT_CERT_ISSUE.to_string()];
                }
            }
        }

        let feed_rows = self
            .db
            .run(
                |conn| Box::pin(async move { sqlx::query(FEEDS_SQL).fetch_all(conn).await }),
                0,
            )
            .await?;
        for row in feed_rows {
            let feed_id: i64 = row.get("id");
            let source_id: i64 = row.get("sources_id");
            let raw_url: String = row.get("url");
            let url = match Url::parse(&raw_url) {
                Ok(u) => u,
                Err(err) => {
                    tracing::error!(feed = feed_id, url = %raw_url, error = %err, "skipping feed with unparsable URL");
                    continue;
                }
            };
            let level = row
                .get::<String, _>("log_lvl")
                .parse::<FeedLogLevel>()
                .unwrap_or(self.cfg.feed_log_level);
            let Some(source) = self.sources.iter_mut().find(|s| s.id == source_id) else {
                tracing::error!(feed = feed_id, source = source_id, "skipping feed of unknown source");
                continue;
            };
            source.feeds.push(Feed::new(
                feed_id,
                source_id,
                row.get("label"),
                url,
                row.get("rolie"),
                level,
            ));
        }
        tracing::info!(
            sources = self.sources.len(),
            feeds = self.sources.iter().map(|s| s.feeds.len()).sum::<usize>(),
            "catalogue loaded"
        );
        Ok(())
    }

    /// The command loop. Runs until the shutdown signal fires or
    /// [`SourceManager::kill`] was called, then drains the workers.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(
            self.jobs_rx.take().expect("run() called twice"),
        ));
        let downloader = Arc::new(Downloader {
            db: self.db.clone(),
            keys: self.keys_cache.clone(),
            validator: self.validator.clone(),
            store: self.store.clone(),
        });
        let mut workers = JoinSet::new();
        for _ in 0..self.cfg.download_slots {
            workers.spawn(downloader.clone().worker(
                jobs_rx.clone(),
                self.fns_tx.clone(),
                shutdown.clone(),
            ));
        }

        let mut ticker = tokio::time::interval(REFRESH_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown_rx = shutdown.clone();

        enum Wake {
            Command(Option<Command>),
            Shutdown(bool),
            Tick,
        }
        while !self.done {
            self.pmd_cache.sweep();
            self.keys_cache.sweep();
            self.compact_done();
            self.prune_feed_logs().await;
            self.refresh_feeds().await;
            self.start_downloads().await;
            let wake = tokio::select! {
                command = self.fns_rx.recv() => Wake::Command(command),
                changed = shutdown_rx.changed() => {
                    Wake::Shutdown(changed.is_err() || *shutdown_rx.borrow())
                }
                _ = ticker.tick() => Wake::Tick,
            };
            match wake {
                Wake::Command(Some(f)) => f(&mut self).await,
                Wake::Command(None) => break,
                Wake::Shutdown(stop) => {
                    if stop {
                        break;
                    }
                }
                Wake::Tick => {}
            }
        }

        // Closing the jobs channel tells the workers to drain and exit.
        drop(self.jobs_tx.take());
        while workers.join_next().await.is_some() {}
        tracing::info!("source manager stopped");
    }

    fn next_scheduler_id(&mut self) -> u64 {
        // Start with 1 to avoid clashes with zeroed locations.
        self.unique_id += 1;
        self.unique_id
    }

    fn find_source_idx(&self, source_id: i64) -> Option<usize> {
        self.sources.iter().position(|s| s.id == source_id)
    }

    fn find_feed_pos(&self, feed_id: i64) -> Option<(usize, usize)> {
        for (si, source) in self.sources.iter().enumerate() {
            if let Some(fi) = source.feeds.iter().position(|f| f.id == feed_id) {
                return Some((si, fi));
            }
        }
        None
    }

    /// Drop downloaded locations from all feed queues.
    fn compact_done(&mut self) {
        for source in &mut self.sources {
            for feed in &mut source.feeds {
                feed.compact_done();
            }
        }
    }

    /// Delete old feed log entries, at most once per tick.
    async fn prune_feed_logs(&mut self) {
        let Some(keep) = self.cfg.keep_feed_logs() else {
            return;
        };
        let now = Instant::now();
        if let Some(last) = self.last_log_prune
            && now.duration_since(last) < REFRESH_TICK
        {
            return;
        }
        self.last_log_prune = Some(now);
        let cutoff = OffsetDateTime::now_utc() - keep;
        const SQL: &str = "DELETE FROM feed_logs WHERE time < $1";
        let result = self
            .db
            .run(
                move |conn| {
                    Box::pin(async move {
                        sqlx::query(SQL).bind(cutoff).execute(conn).await.map(|_| ())
                    })
                },
                0,
            )
            .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "pruning feed logs failed");
        }
    }

    /// Refresh every active feed whose next check has elapsed.
    async fn refresh_feeds(&mut self) {
        let now = OffsetDateTime::now_utc();
        let mut due = Vec::new();
        for (si, source) in self.sources.iter().enumerate() {
            if !source.active {
                continue;
            }
            for (fi, feed) in source.feeds.iter().enumerate() {
                if feed.needs_refresh(now) {
                    due.push((si, fi));
                }
            }
        }
        for (si, fi) in due {
            let (feed_id, feed_url, rolie, level) = {
                let feed = &self.sources[si].feeds[fi];
                (feed.id, feed.url.clone(), feed.rolie, feed.log_level.clone())
            };
            tracing::debug!(feed = feed_id, source = %self.sources[si].name, "refreshing feed");
            match self.sources[si].ensure_client(&self.cfg) {
                Ok(client) => {
                    let age = self.sources[si].age;
                    let ignore = self.sources[si].ignore_patterns.clone();
                    match fetch_listing(&client, &feed_url, rolie).await {
                        Ok((discovered, problems)) => {
                            for problem in problems {
                                log_feed(&self.db, feed_id, &level, FeedLogLevel::Warn, problem)
                                    .await;
                            }
                            let fresh = self.filter_locations(discovered, age, &ignore, now).await;
                            let feed = &mut self.sources[si].feeds[fi];
                            for loc in fresh {
                                if !feed.knows_url(&loc.url) {
                                    feed.queue.push(Location::from_discovered(loc));
                                }
                            }
                        }
                        Err(err) => {
                            log_feed(
                                &self.db,
                                feed_id,
                                &level,
                                FeedLogLevel::Error,
                                format!("feed refresh failed: {err}"),
                            )
                            .await;
                        }
                    }
                }
                Err(err) => {
                    log_feed(
                        &self.db,
                        feed_id,
                        &level,
                        FeedLogLevel::Error,
                        format!("feed refresh failed: {err}"),
                    )
                    .await;
                }
            }
            // Even if there was an error try again later.
            self.sources[si].feeds[fi].next_check =
                Some(OffsetDateTime::now_utc() + self.cfg.feed_refresh());
        }
    }

    /// Apply the source's ignore patterns, the age window and the
    /// document store's freshness check to discovered locations.
    async fn filter_locations(
        &self,
        discovered: Vec<DiscoveredLocation>,
        age: Option<time::Duration>,
        ignore: &[Regex],
        now: OffsetDateTime,
    ) -> Vec<DiscoveredLocation> {
        let mut out = Vec::with_capacity(discovered.len());
        for loc in discovered {
            if ignore.iter().any(|p| p.is_match(loc.url.as_str())) {
                continue;
            }
            if let (Some(age), Some(changed)) = (age, loc.changed)
                && changed < now - age
            {
                continue;
            }
            match self.store.is_current(&loc.url, loc.changed).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    // Keep the candidate; the download path decides.
                    tracing::warn!(url = %loc.url, error = %err, "freshness check failed");
                }
            }
            out.push(loc);
        }
        out
    }

    /// Start downloads while the global and per-source budgets allow,
    /// visiting the active feeds in a fresh random order per pass.
    async fn start_downloads(&mut self) {
        let Some(jobs_tx) = self.jobs_tx.clone() else {
            return;
        };
        let cfg = self.cfg.clone();
        while self.used_slots < cfg.download_slots {
            let mut started = false;
            let mut order = Vec::new();
            for (si, source) in self.sources.iter().enumerate() {
                if !source.active {
                    continue;
                }
                for fi in 0..source.feeds.len() {
                    order.push((si, fi));
                }
            }
            order.shuffle(&mut rand::thread_rng());
            for (si, fi) in order {
                if self.used_slots >= cfg.download_slots {
                    break;
                }
                if self.sources[si].used_slots >= self.sources[si].effective_slots(&cfg) {
                    continue;
                }
                let has_waiting = self.sources[si].feeds[fi]
                    .queue
                    .iter()
                    .any(|l| l.state == LocationState::Waiting);
                if !has_waiting {
                    continue;
                }
                let client = match self.sources[si].ensure_client(&cfg) {
                    Ok(client) => client,
                    Err(err) => {
                        tracing::warn!(source = %self.sources[si].name, error = %err, "no usable HTTP client");
                        continue;
                    }
                };
                let scheduler_id = self.next_scheduler_id();
                self.used_slots += 1;
                let source = &mut self.sources[si];
                source.used_slots += 1;
                let limiter = source.limiter();
                let strict_mode = source.strict_mode_effective(&cfg);
                let signature_check = source.signature_check_effective(&cfg);
                let source_id = source.id;
                let source_url = source.url.clone();
                let feed = &mut source.feeds[fi];
                let location = {
                    let location = feed.find_waiting().expect("waiting location vanished");
                    location.state = LocationState::Running;
                    location.id = scheduler_id;
                    location.clone()
                };
                let job = DownloadJob {
                    location,
                    ctx: FeedContext {
                        feed_id: feed.id,
                        source_id,
                        source_url,
                        log_level: feed.log_level.clone(),
                        invalid: feed.invalid.clone(),
                        client,
                        limiter,
                        strict_mode,
                        signature_check,
                    },
                };
                started = true;
                if jobs_tx.send(job).await.is_err() {
                    return;
                }
            }
            if !started {
                return;
            }
        }
    }

    /// Completion of a download job: release both slots (clamped at
    /// zero) and mark the location done. A persisted advisory flags the
    /// source for attention, database first.
    pub(crate) async fn finish_download(
        &mut self,
        source_id: i64,
        feed_id: i64,
        scheduler_id: u64,
        stored: bool,
    ) {
        self.used_slots = self.used_slots.saturating_sub(1);
        let Some(si) = self.find_source_idx(source_id) else {
            return;
        };
        let source = &mut self.sources[si];
        source.used_slots = source.used_slots.saturating_sub(1);
        if let Some(feed) = source.feeds.iter_mut().find(|f| f.id == feed_id)
            && let Some(location) = feed.find_by_scheduler_id(scheduler_id)
        {
            location.state = LocationState::Done;
        }
        if stored {
            let now = OffsetDateTime::now_utc();
            const SQL: &str = "UPDATE sources SET checksum_updated = $1 WHERE id = $2";
            let result = self
                .db
                .run(
                    move |conn| {
                        Box::pin(async move {
                            sqlx::query(SQL)
                                .bind(now)
                                .bind(source_id)
                                .execute(conn)
                                .await
                                .map(|_| ())
                        })
                    },
                    0,
                )
                .await;
            match result {
                Ok(()) => self.sources[si].checksum_updated = now,
                Err(err) => {
                    tracing::error!(source = source_id, error = %err, "flagging source attention failed");
                }
            }
        }
    }

    /// Wake the loop from outside the command stream.
    fn background_ping(&self) {
        fn noop(_m: &mut Manager) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
        let tx = self.fns_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Box::new(noop) as Command).await;
        });
    }

    /// Persist `active = false` plus the cert-issue status.
    async fn persist_deactivation(&mut self, si: usize) {
        let source = &mut self.sources[si];
        source.active = false;
        source.status = vec![DEACTIVATED_DUE_TO_CLIENT_CERT_ISSUE.to_string()];
        let id = source.id;
        let status = source.status.clone();
        const SQL: &str = "UPDATE sources SET (active, status) = ($1, $2) WHERE id = $3";
        let result = self
            .db
            .run(
                move |conn| {
                    let status = status.clone();
                    Box::pin(async move {
                        sqlx::query(SQL)
                            .bind(false)
                            .bind(status)
                            .bind(id)
                            .execute(conn)
                            .await
                            .map(|_| ())
                    })
                },
                0,
            )
            .await;
        if let Err(err) = result {
            tracing::error!(source = id, error = %err, "deactivating source failed");
        }
    }

    fn source_info(&self, source: &Source, stats: bool) -> SourceInfo {
        let stats = stats.then(|| {
            let mut st = Stats::default();
            source.add_stats(&mut st);
            st
        });
        SourceInfo {
            id: source.id,
            name: source.name.clone(),
            url: source.url.clone(),
            active: source.active,
            attention: source.attention(),
            status: source.status.clone(),
            rate: source.rate,
            slots: source.slots,
            headers: source.headers.clone(),
            strict_mode: source.strict_mode,
            insecure: source.insecure,
            signature_check: source.signature_check,
            age: source.age,
            ignore_patterns: source
                .ignore_patterns
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
            has_client_cert_public: source.client_cert_public.is_some(),
            has_client_cert_private: source.client_cert_private.is_some(),
            has_client_cert_passphrase: source.client_cert_passphrase.is_some(),
            stats,
        }
    }

    fn feed_info(&self, feed: &Feed, stats: bool) -> FeedInfo {
        let stats = stats.then(|| {
            let mut st = Stats::default();
            feed.add_stats(&mut st);
            st
        });
        FeedInfo {
            id: feed.id,
            label: feed.label.clone(),
            url: feed.url.clone(),
            rolie: feed.rolie,
            log_level: feed.log_level.load(),
            stats,
        }
    }

    async fn add_source_cmd(&mut self, prepared: PreparedSource) -> Result<i64, Error> {
        if self.sources.iter().any(|s| s.name == prepared.name) {
            return Err(Error::invalid("source already exists"));
        }
        let encrypted_private = prepared
            .client_cert_private
            .as_deref()
            .map(|d| self.crypto.encrypt(d))
            .transpose()?;
        let encrypted_passphrase = prepared
            .client_cert_passphrase
            .as_deref()
            .map(|d| self.crypto.encrypt(d))
            .transpose()?;
        const SQL: &str = "INSERT INTO sources (\
             name, url, rate, slots, headers, \
             strict_mode, insecure, signature_check, age, ignore_patterns, \
             client_cert_public, client_cert_private, client_cert_passphrase) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING id";
        let insert = prepared.clone();
        let id: i64 = self
            .db
            .run(
                move |conn| {
                    let p = insert.clone();
                    let private = encrypted_private.clone();
                    let passphrase = encrypted_passphrase.clone();
                    Box::pin(async move {
                        let row = sqlx::query(SQL)
                            .bind(p.name)
                            .bind(p.url)
                            .bind(p.rate)
                            .bind(p.slots.map(|s| s as i32))
                            .bind(p.headers)
                            .bind(p.strict_mode)
                            .bind(p.insecure)
                            .bind(p.signature_check)
                            .bind(p.age.map(interval_from_duration))
                            .bind(p.ignore_patterns.iter().map(|r| r.as_str().to_string()).collect::<Vec<_>>())
                            .bind(p.client_cert_public)
                            .bind(private)
                            .bind(passphrase)
                            .fetch_one(conn)
                            .await?;
                        Ok(row.get::<i64, _>("id"))
                    })
                },
                0,
            )
            .await?;
        let now = OffsetDateTime::now_utc();
        let mut source = Source::new(
            id,
            prepared.name,
            prepared.url,
            false,
            prepared.rate,
            prepared.slots,
            prepared.headers,
            prepared.strict_mode,
            prepared.insecure,
            prepared.signature_check,
            prepared.age,
            prepared.ignore_patterns,
            prepared.client_cert_public,
            prepared.client_cert_private,
            prepared.client_cert_passphrase,
            Vec::new(),
            now,
            now,
        );
        if source.has_client_cert()
            && let Err(err) = source.update_client(&self.cfg)
        {
            tracing::warn!(source = %source.name, error = %err, "client cert of new source unusable");
            source.status = vec![DEACTIVATED_DUE_TO_CLIENT_CERT_ISSUE.to_string()];
        }
        self.sources.push(source);
        Ok(id)
    }

    async fn add_feed_cmd(
        &mut self,
        source_id: i64,
        label: String,
        url: Url,
        log_level: FeedLogLevel,
    ) -> Result<i64, Error> {
        let Some(si) = self.find_source_idx(source_id) else {
            return Err(Error::NoSuchEntry("no such source"));
        };
        if self.sources[si].feeds.iter().any(|f| f.label == label) {
            return Err(Error::invalid("label already exists"));
        }
        let source_url = self.sources[si].url.clone();
        let loaded = self.pmd_cache.pmd(&source_url).await;
        let Some(document) = &loaded.document else {
            return Err(Error::invalid("PMD is invalid"));
        };
        let rolie = pmd::is_rolie_feed(document, &url);
        if !rolie && !pmd::is_directory_feed(document, &url) {
            return Err(Error::invalid("feed is neither ROLIE nor directory based"));
        }
        const SQL: &str = "INSERT INTO feeds (label, sources_id, url, rolie, log_lvl) \
             VALUES ($1, $2, $3, $4, $5::feed_logs_level) \
             RETURNING id";
        let (insert_label, insert_url) = (label.clone(), url.to_string());
        let level_str = log_level.as_str();
        let feed_id: i64 = self
            .db
            .run(
                move |conn| {
                    let label = insert_label.clone();
                    let url = insert_url.clone();
                    Box::pin(async move {
                        let row = sqlx::query(SQL)
                            .bind(label)
                            .bind(source_id)
                            .bind(url)
                            .bind(rolie)
                            .bind(level_str)
                            .fetch_one(conn)
                            .await?;
                        Ok(row.get::<i64, _>("id"))
                    })
                },
                0,
            )
            .await?;
        let source = &mut self.sources[si];
        source
            .feeds
            .push(Feed::new(feed_id, source_id, label, url, rolie, log_level));
        if source.active {
            self.background_ping();
        }
        Ok(feed_id)
    }

    async fn remove_source_cmd(&mut self, source_id: i64) -> Result<(), Error> {
        let Some(si) = self.find_source_idx(source_id) else {
            return Err(Error::NoSuchEntry("no such source"));
        };
        const SQL: &str = "DELETE FROM sources WHERE id = $1";
        let affected: u64 = self
            .db
            .run(
                move |conn| {
                    Box::pin(async move {
                        let result = sqlx::query(SQL).bind(source_id).execute(conn).await?;
                        Ok(result.rows_affected())
                    })
                },
                0,
            )
            .await?;
        let mut source = self.sources.remove(si);
        source.active = false;
        for feed in &source.feeds {
            feed.invalid.store(true, Ordering::Relaxed);
        }
        source.feeds.clear();
        if affected == 0 {
            // The catalogue knew the source but the table did not.
            tracing::warn!(source = source_id, "source removal affected no rows, should not happen");
            return Err(Error::NoSuchEntry("no such source"));
        }
        Ok(())
    }

    async fn remove_feed_cmd(&mut self, feed_id: i64) -> Result<(), Error> {
        let Some((si, fi)) = self.find_feed_pos(feed_id) else {
            return Err(Error::NoSuchEntry("no such feed"));
        };
        self.sources[si].feeds[fi]
            .invalid
            .store(true, Ordering::Relaxed);
        const SQL: &str = "DELETE FROM feeds WHERE id = $1";
        self.db
            .run(
                move |conn| {
                    Box::pin(async move {
                        sqlx::query(SQL).bind(feed_id).execute(conn).await.map(|_| ())
                    })
                },
                0,
            )
            .await?;
        self.sources[si].feeds.remove(fi);
        Ok(())
    }

    async fn update_source_cmd<F>(
        &mut self,
        source_id: i64,
        updates: F,
    ) -> Result<SourceUpdateOutcome, Error>
    where
        F: FnOnce(&mut SourceUpdater<'_>) -> Result<(), Error>,
    {
        let Some(si) = self.find_source_idx(source_id) else {
            return Err(Error::NoSuchEntry("no such source"));
        };
        let sibling_names: Vec<String> = self
            .sources
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != si)
            .map(|(_, s)| s.name.clone())
            .collect();
        let staged = {
            let mut updater =
                SourceUpdater::new(&self.cfg, &self.crypto, &self.sources[si], sibling_names);
            updates(&mut updater)?;
            updater.finish()
        };
        if staged.is_empty() {
            return Ok(SourceUpdateOutcome::Unchanged);
        }
        let sql = build_update_sql("sources", &staged.fields, &staged.values);
        let values = staged.values.clone();
        let id = self.sources[si].id;
        self.db
            .run(
                move |conn| {
                    let sql = sql.clone();
                    let values = values.clone();
                    Box::pin(async move {
                        let mut query = sqlx::query(&sql);
                        for value in &values {
                            query = value.bind(query);
                        }
                        query = query.bind(id);
                        query.execute(conn).await.map(|_| ())
                    })
                },
                0,
            )
            .await?;
        // Only apply changes after the database accepted the update.
        for change in staged.changes {
            change.apply(&mut self.sources[si]);
        }
        if staged.activated {
            self.background_ping();
        }
        if staged.client_cert_updated {
            match self.sources[si].update_client(&self.cfg) {
                Err(err) => {
                    tracing::warn!(source = source_id, error = %err, "updating client cert failed");
                    if self.sources[si].active {
                        self.persist_deactivation(si).await;
                        return Ok(SourceUpdateOutcome::Deactivated);
                    }
                }
                Ok(()) => {
                    self.sources[si].status.clear();
                }
            }
        }
        Ok(SourceUpdateOutcome::Updated)
    }

    async fn update_feed_cmd<F>(&mut self, feed_id: i64, updates: F) -> Result<bool, Error>
    where
        F: FnOnce(&mut FeedUpdater<'_>) -> Result<(), Error>,
    {
        let Some((si, fi)) = self.find_feed_pos(feed_id) else {
            return Err(Error::NoSuchEntry("no such feed"));
        };
        let sibling_labels: Vec<String> = self.sources[si]
            .feeds
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != fi)
            .map(|(_, f)| f.label.clone())
            .collect();
        let staged = {
            let mut updater = FeedUpdater::new(&self.sources[si].feeds[fi], sibling_labels);
            updates(&mut updater)?;
            updater.finish()
        };
        if staged.is_empty() {
            return Ok(false);
        }
        let sql = build_update_sql("feeds", &staged.fields, &staged.values);
        let values = staged.values.clone();
        self.db
            .run(
                move |conn| {
                    let sql = sql.clone();
                    let values = values.clone();
                    Box::pin(async move {
                        let mut query = sqlx::query(&sql);
                        for value in &values {
                            query = value.bind(query);
                        }
                        query = query.bind(feed_id);
                        query.execute(conn).await.map(|_| ())
                    })
                },
                0,
            )
            .await?;
        for change in staged.changes {
            change.apply(&mut self.sources[si].feeds[fi]);
        }
        Ok(true)
    }
}

/// A bound parameter of a dynamically built feed-log query.
enum Arg {
    I64(i64),
    Time(OffsetDateTime),
    Text(String),
    TextArray(Vec<String>),
}

fn bind_args<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    args: &[Arg],
    upto: usize,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for arg in args.iter().take(upto) {
        query = match arg {
            Arg::I64(v) => query.bind(*v),
            Arg::Time(v) => query.bind(*v),
            Arg::Text(v) => query.bind(v.clone()),
            Arg::TextArray(v) => query.bind(v.clone()),
        };
    }
    query
}

fn duration_from_interval(interval: PgInterval) -> time::Duration {
    time::Duration::microseconds(interval.microseconds)
        + time::Duration::days(i64::from(interval.days))
        + time::Duration::days(30 * i64::from(interval.months))
}

/// A validated and normalised [`AddSourceRequest`].
#[derive(Clone)]
struct PreparedSource {
    name: String,
    url: String,
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
}

fn prepare_add_source(
    req: AddSourceRequest,
    cfg: &SourcesConfig,
) -> Result<PreparedSource, Error> {
    if req.name.is_empty() {
        return Err(Error::invalid("'name' must not be empty"));
    }
    if req.url.is_empty() {
        return Err(Error::invalid("'url' must not be empty"));
    }
    let rate = normalize_rate(req.rate, cfg)?;
    let slots = normalize_slots(req.slots, cfg)?;
    validate_headers(&req.headers)?;
    let ignore_patterns = as_regexps(&req.ignore_patterns)?;
    let age = match check_age(req.age, cfg)? {
        Some(age) => Some(age),
        None => cfg.default_age(),
    };
    if let Some(public) = &req.client_cert_public
        && !has_pem_block(public)
    {
        return Err(Error::invalid("client_cert_public has no PEM block"));
    }
    if let Some(private) = &req.client_cert_private
        && !has_pem_block(private)
    {
        return Err(Error::invalid("client_cert_private has no PEM block"));
    }
    Ok(PreparedSource {
        name: req.name,
        url: req.url,
        rate,
        slots,
        headers: req.headers,
        strict_mode: req.strict_mode,
        insecure: req.insecure,
        signature_check: req.signature_check,
        age,
        ignore_patterns,
        client_cert_public: req.client_cert_public,
        client_cert_private: req.client_cert_private,
        client_cert_passphrase: req.client_cert_passphrase,
    })
}

/// Cloneable handle onto the manager task.
#[derive(Clone)]
pub struct SourceManager {
    tx: mpsc::Sender<Command>,
    db: Database,
    cfg: SourcesConfig,
    pmd_cache: Arc<PmdCache>,
}

impl SourceManager {
    async fn send(&self, command: Command) -> Result<(), Error> {
        self.tx.send(command).await.map_err(|_| Error::ManagerClosed)
    }

    /// Post a closure and await its reply.
    async fn call<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Manager) -> BoxFuture<'a, T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Box::new(move |m| {
            Box::pin(async move {
                let value = f(m).await;
                let _ = reply_tx.send(value);
            })
        }))
        .await?;
        reply_rx.await.map_err(|_| Error::ManagerClosed)
    }

    /// All sources, optionally with queue statistics.
    pub async fn sources(&self, stats: bool) -> Result<Vec<SourceInfo>, Error> {
        self.call(move |m| {
            Box::pin(async move {
                m.sources
                    .iter()
                    .map(|s| m.source_info(s, stats))
                    .collect::<Vec<_>>()
            })
        })
        .await
    }

    /// One source by id.
    pub async fn source(&self, source_id: i64, stats: bool) -> Result<SourceInfo, Error> {
        self.call(move |m| {
            Box::pin(async move {
                m.find_source_idx(source_id)
                    .map(|si| m.source_info(&m.sources[si], stats))
                    .ok_or(Error::NoSuchEntry("no such source"))
            })
        })
        .await?
    }

    /// The valid feeds of a source.
    pub async fn feeds(&self, source_id: i64, stats: bool) -> Result<Vec<FeedInfo>, Error> {
        self.call(move |m| {
            Box::pin(async move {
                let si = m
                    .find_source_idx(source_id)
                    .ok_or(Error::NoSuchEntry("no such source"))?;
                Ok(m.sources[si]
                    .feeds
                    .iter()
                    .filter(|f| !f.invalid.load(Ordering::Relaxed))
                    .map(|f| m.feed_info(f, stats))
                    .collect::<Vec<_>>())
            })
        })
        .await?
    }

    /// One feed by id.
    pub async fn feed(&self, feed_id: i64, stats: bool) -> Result<FeedInfo, Error> {
        self.call(move |m| {
            Box::pin(async move {
                let Some((si, fi)) = m.find_feed_pos(feed_id) else {
                    return Err(Error::NoSuchEntry("no such feed"));
                };
                let feed = &m.sources[si].feeds[fi];
                if feed.invalid.load(Ordering::Relaxed) {
                    return Err(Error::NoSuchEntry("no such feed"));
                }
                Ok(m.feed_info(feed, stats))
            })
        })
        .await?
    }

    /// Sources flagged for attention, or all of them when `all`.
    pub async fn attention_sources(&self, all: bool) -> Result<Vec<AttentionSource>, Error> {
        self.call(move |m| {
            Box::pin(async move {
                m.sources
                    .iter()
                    .filter(|s| all || s.attention())
                    .map(|s| AttentionSource {
                        id: s.id,
                        name: s.name.clone(),
                        attention: s.attention(),
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await
    }

    /// Which of the given provider URLs are covered by configured
    /// sources, and through which feeds.
    pub async fn subscriptions(&self, urls: Vec<String>) -> Result<Vec<SourceSubscriptions>, Error> {
        self.call(move |m| {
            Box::pin(async move {
                let wanted: HashSet<&str> = urls.iter().map(String::as_str).collect();
                m.sources
                    .iter()
                    .filter(|s| wanted.contains(s.url.as_str()))
                    .map(|s| SourceSubscriptions {
                        id: s.id,
                        name: s.name.clone(),
                        url: s.url.clone(),
                        subscriptions: s
                            .feeds
                            .iter()
                            .filter(|f| !f.invalid.load(Ordering::Relaxed))
                            .map(|f| f.url.to_string())
                            .collect(),
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await
    }

    /// The provider metadata for a URL, through the coalescing cache.
    pub async fn pmd(&self, url: &str) -> Arc<LoadedProviderMetadata> {
        self.pmd_cache.pmd(url).await
    }

    /// Register a new source. The PMD must load and validate first.
    pub async fn add_source(&self, req: AddSourceRequest) -> Result<i64, Error> {
        let prepared = prepare_add_source(req, &self.cfg)?;
        let loaded = self.pmd_cache.pmd(&prepared.url).await;
        if !loaded.is_valid() {
            return Err(Error::invalid("PMD is invalid"));
        }
        self.call(move |m| Box::pin(async move { m.add_source_cmd(prepared).await }))
            .await?
    }

    /// Add a feed to a source. The URL must be one of the PMD's ROLIE
    /// feeds or live under one of its directory trees.
    pub async fn add_feed(
        &self,
        source_id: i64,
        label: String,
        url: Url,
        log_level: Option<FeedLogLevel>,
    ) -> Result<i64, Error> {
        if label.is_empty() {
            return Err(Error::invalid("'label' must not be empty"));
        }
        let log_level = log_level.unwrap_or(self.cfg.feed_log_level);
        self.call(move |m| {
            Box::pin(async move { m.add_feed_cmd(source_id, label, url, log_level).await })
        })
        .await?
    }

    /// Remove a source, its feeds and their queues.
    pub async fn remove_source(&self, source_id: i64) -> Result<(), Error> {
        self.call(move |m| Box::pin(async move { m.remove_source_cmd(source_id).await }))
            .await?
    }

    /// Remove a feed.
    pub async fn remove_feed(&self, feed_id: i64) -> Result<(), Error> {
        self.call(move |m| Box::pin(async move { m.remove_feed_cmd(feed_id).await }))
            .await?
    }

    /// Run an update session against a source.
    pub async fn update_source<F>(
        &self,
        source_id: i64,
        updates: F,
    ) -> Result<SourceUpdateOutcome, Error>
    where
        F: FnOnce(&mut SourceUpdater<'_>) -> Result<(), Error> + Send + 'static,
    {
        self.call(move |m| Box::pin(async move { m.update_source_cmd(source_id, updates).await }))
            .await?
    }

    /// Run an update session against a feed. Returns whether anything
    /// changed.
    pub async fn update_feed<F>(&self, feed_id: i64, updates: F) -> Result<bool, Error>
    where
        F: FnOnce(&mut FeedUpdater<'_>) -> Result<(), Error> + Send + 'static,
    {
        self.call(move |m| Box::pin(async move { m.update_feed_cmd(feed_id, updates).await }))
            .await?
    }

    /// Query feed logs. Goes straight to the database; the catalogue is
    /// not involved.
    pub async fn feed_log(
        &self,
        query: &FeedLogQuery,
    ) -> Result<(Vec<FeedLogEntry>, Option<i64>), Error> {
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<Arg> = Vec::new();
        if let Some(feed_id) = query.feed_id {
            args.push(Arg::I64(feed_id));
            conditions.push(format!("feeds_id = ${}", args.len()));
        }
        if let Some(from) = query.from {
            args.push(Arg::Time(from));
            conditions.push(format!("time >= ${}", args.len()));
        }
        if let Some(to) = query.to {
            args.push(Arg::Time(to));
            conditions.push(format!("time <= ${}", args.len()));
        }
        if let Some(search) = &query.search
            && !search.is_empty()
        {
            args.push(Arg::Text(format!("%{}%", search.replace('%', "\\%"))));
            conditions.push(format!("msg ILIKE ${}", args.len()));
        }
        if !query.levels.is_empty() {
            args.push(Arg::TextArray(
                query.levels.iter().map(|l| l.as_str().to_string()).collect(),
            ));
            conditions.push(format!("lvl::text = ANY(${})", args.len()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        // Counting ignores limit, offset and order.
        let count_sql = query
            .count
            .then(|| format!("SELECT count(*) FROM feed_logs{where_clause}"));
        let mut select_sql =
            format!("SELECT feeds_id, time, lvl::text AS lvl, msg FROM feed_logs{where_clause} ORDER BY time DESC");
        let count_args = args.len();
        if query.offset >= 0 {
            args.push(Arg::I64(query.offset));
            select_sql.push_str(&format!(" OFFSET ${}", args.len()));
        }
        if query.limit >= 0 {
            args.push(Arg::I64(query.limit));
            select_sql.push_str(&format!(" LIMIT ${}", args.len()));
        }
        tracing::debug!(stmt = %select_sql, "feed log select");

        let args = Arc::new(args);
        let (entries, counter) = self
            .db
            .run(
                move |conn| {
                    let args = args.clone();
                    let count_sql = count_sql.clone();
                    let select_sql = select_sql.clone();
                    Box::pin(async move {
                        let mut counter = None;
                        if let Some(count_sql) = &count_sql {
                            let row = bind_args(sqlx::query(count_sql), &args, count_args)
                                .fetch_one(&mut *conn)
                                .await?;
                            counter = Some(row.get::<i64, _>(0));
                        }
                        let rows = bind_args(sqlx::query(&select_sql), &args, args.len())
                            .fetch_all(&mut *conn)
                            .await?;
                        let entries = rows
                            .into_iter()
                            .map(|row| FeedLogEntry {
                                feed_id: row.get("feeds_id"),
                                time: row.get("time"),
                                level: row
                                    .get::<String, _>("lvl")
                                    .parse()
                                    .unwrap_or(FeedLogLevel::Error),
                                message: row.get("msg"),
                            })
                            .collect();
                        Ok((entries, counter))
                    })
                },
                0,
            )
            .await?;
        Ok((entries, counter))
    }

    /// Wake the manager loop.
    pub async fn ping(&self) -> Result<(), Error> {
        self.send(Box::new(|_m| Box::pin(async {}))).await
    }

    /// Ask the manager to stop. The loop exits after draining workers.
    pub async fn kill(&self) -> Result<(), Error> {
        self.send(Box::new(|m| {
            Box::pin(async move {
                m.done = true;
            })
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_applies_default_age() {
        let cfg = SourcesConfig {
            default_age_secs: 86400,
            ..SourcesConfig::default()
        };
        let req = AddSourceRequest {
            name: "s".to_string(),
            url: "https://example.com/pmd.json".to_string(),
            ..AddSourceRequest::default()
        };
        let prepared = prepare_add_source(req, &cfg).unwrap();
        assert_eq!(prepared.age, Some(time::Duration::days(1)));
    }

    #[test]
    fn prepare_normalises_zero_rate_and_slots() {
        let cfg = SourcesConfig::default();
        let req = AddSourceRequest {
            name: "s".to_string(),
            url: "https://example.com/pmd.json".to_string(),
            rate: Some(0.0),
            slots: Some(0),
            ..AddSourceRequest::default()
        };
        let prepared = prepare_add_source(req, &cfg).unwrap();
        assert_eq!(prepared.rate, None);
        assert_eq!(prepared.slots, None);
    }

    #[test]
    fn prepare_rejects_invalid_input() {
        let cfg = SourcesConfig {
            max_rate_per_source: 2.0,
            ..SourcesConfig::default()
        };
        let base = AddSourceRequest {
            name: "s".to_string(),
            url: "https://example.com/pmd.json".to_string(),
            ..AddSourceRequest::default()
        };
        let no_name = AddSourceRequest {
            name: String::new(),
            ..base.clone()
        };
        assert!(prepare_add_source(no_name, &cfg).is_err());
        let too_fast = AddSourceRequest {
            rate: Some(3.0),
            ..base.clone()
        };
        assert!(prepare_add_source(too_fast, &cfg).is_err());
        let bad_cert = AddSourceRequest {
            client_cert_public: Some(b"not pem".to_vec()),
            ..base
        };
        assert!(prepare_add_source(bad_cert, &cfg).is_err());
    }

    #[test]
    fn interval_roundtrip() {
        let d = time::Duration::hours(3);
        assert_eq!(duration_from_interval(interval_from_duration(d)), d);
    }
}
