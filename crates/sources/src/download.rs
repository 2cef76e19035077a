//! Download workers and the per-advisory download pipeline.
//!
//! Workers consume jobs from a shared channel, run the pipeline (fetch,
//! checksum, signature, parse, validate, persist) and report back by
//! posting a completion closure on the command channel. They never touch
//! catalogue state directly.

use crate::feed::{LevelCell, Location, log_feed};
use crate::keys_cache::KeysCache;
use crate::manager::Command;
use governor::DefaultDirectRateLimiter;
use scythe_core::loglevel::FeedLogLevel;
use scythe_csaf::{DocumentStore, RemoteValidator};
use scythe_db::Database;
use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, watch};
use url::Url;

/// Everything a worker needs to know about the feed of a job. Snapshot
/// semantics except for the two atomics shared with the manager.
#[derive(Clone)]
pub(crate) struct FeedContext {
    pub feed_id: i64,
    pub source_id: i64,
    pub source_url: String,
    pub log_level: Arc<LevelCell>,
    pub invalid: Arc<AtomicBool>,
    pub client: Arc<reqwest::Client>,
    pub limiter: Option<Arc<DefaultDirectRateLimiter>>,
    pub strict_mode: bool,
    pub signature_check: bool,
}

/// One unit of work for the pool.
pub(crate) struct DownloadJob {
    pub location: Location,
    pub ctx: FeedContext,
}

/// Shared dependencies of all workers.
pub(crate) struct Downloader {
    pub db: Database,
    pub keys: Arc<KeysCache>,
    pub validator: Option<Arc<dyn RemoteValidator>>,
    pub store: Arc<dyn DocumentStore>,
}

impl Downloader {
    /// Worker loop: runs until the jobs channel closes. Every job is
    /// answered with a completion closure, success or not.
    pub(crate) async fn worker(
        self: Arc<Self>,
        jobs: Arc<Mutex<mpsc::Receiver<DownloadJob>>>,
        fns: mpsc::Sender<Command>,
        shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let job = {
                let mut rx = jobs.lock().await;
                rx.recv().await
            };
            let Some(job) = job else { break };
            let mut shutdown = shutdown.clone();
            let stored = self.download(&job, &mut shutdown).await;
            let (source_id, feed_id, scheduler_id) =
                (job.ctx.source_id, job.ctx.feed_id, job.location.id);
            let completion: Command = Box::new(move |m| {
                Box::pin(async move {
                    m.finish_download(source_id, feed_id, scheduler_id, stored).await;
                })
            });
            if fns.send(completion).await.is_err() {
                // Manager already gone; nothing left to report to.
                break;
            }
        }
    }

    async fn log(&self, ctx: &FeedContext, level: FeedLogLevel, message: String) {
        log_feed(&self.db, ctx.feed_id, &ctx.log_level, level, message).await;
    }

    /// Take a rate token before an HTTP request, if the source is paced.
    async fn pace(&self, ctx: &FeedContext) {
        if let Some(limiter) = &ctx.limiter {
            limiter.until_ready().await;
        }
    }

    /// Run the pipeline for one location. Returns whether the advisory
    /// was persisted; failures are logged to the feed log.
    async fn download(&self, job: &DownloadJob, shutdown: &mut watch::Receiver<bool>) -> bool {
        let ctx = &job.ctx;
        let url = &job.location.url;

        if ctx.invalid.load(Ordering::Relaxed) || *shutdown.borrow() {
            return false;
        }

        self.pace(ctx).await;
        let data = match fetch(&ctx.client, url, shutdown).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::debug!(%url, "download cancelled by shutdown");
                return false;
            }
            Err(err) => {
                self.log(ctx, FeedLogLevel::Error, err).await;
                return false;
            }
        };

        match self.verify_checksum(ctx, &job.location, &data, shutdown).await {
            Ok(true) => {}
            Ok(false) => {
                self.log(ctx, FeedLogLevel::Debug, format!("no checksum available for {url}"))
                    .await;
            }
            Err(err) => {
                self.log(ctx, FeedLogLevel::Error, err).await;
                return false;
            }
        }

        if ctx.signature_check
            && let Err(err) = self.verify_signature(ctx, &job.location, &data, shutdown).await
        {
            self.log(ctx, FeedLogLevel::Error, err).await;
            return false;
        }

        let document: serde_json::Value = match serde_json::from_slice(&data) {
            Ok(doc) => doc,
            Err(err) => {
                self.log(ctx, FeedLogLevel::Error, format!("{url} is not valid JSON: {err}"))
                    .await;
                return false;
            }
        };
        if ctx.strict_mode && document.get("document").is_none() {
            self.log(
                ctx,
                FeedLogLevel::Error,
                format!("{url} is not a CSAF document (no 'document' member)"),
            )
            .await;
            return false;
        }

        if let Some(validator) = &self.validator {
            match validator.validate(&document).await {
                Ok(result) if !result.valid => {
                    self.log(
                        ctx,
                        FeedLogLevel::Error,
                        format!("remote validation of {url} failed: {}", result.messages.join("; ")),
                    )
                    .await;
                    return false;
                }
                Ok(_) => {}
                Err(err) => {
                    self.log(
                        ctx,
                        FeedLogLevel::Error,
                        format!("remote validation of {url} errored: {err}"),
                    )
                    .await;
                    return false;
                }
            }
        }

        if let Err(err) = self
            .store
            .store(ctx.source_id, ctx.feed_id, url, &document)
            .await
        {
            self.log(ctx, FeedLogLevel::Error, format!("storing {url} failed: {err}"))
                .await;
            return false;
        }
        self.log(ctx, FeedLogLevel::Info, format!("downloaded {url}")).await;
        true
    }

    /// Verify the advisory against an advertised or derived checksum
    /// document. `Ok(false)` means no checksum could be fetched.
    async fn verify_checksum(
        &self,
        ctx: &FeedContext,
        location: &Location,
        data: &[u8],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, String> {
        let candidates = if location.hashes.is_empty() {
            derived_hash_urls(&location.url)
        } else {
            location.hashes.clone()
        };
        for candidate in &candidates {
            self.pace(ctx).await;
            let body = match fetch(&ctx.client, candidate, shutdown).await {
                Ok(Some(body)) => body,
                // Cancelled: the main fetch already went through, treat
                // like a missing checksum.
                Ok(None) => return Ok(false),
                Err(_) => continue,
            };
            let text = String::from_utf8_lossy(&body);
            let Some(expected) = text.split_whitespace().next() else {
                continue;
            };
            let actual = match hash_algorithm(candidate, expected) {
                Some(HashAlgorithm::Sha256) => hex(&Sha256::digest(data)),
                Some(HashAlgorithm::Sha512) => hex(&Sha512::digest(data)),
                None => continue,
            };
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(format!(
                    "checksum mismatch for {}: {} expected {expected}, got {actual}",
                    location.url, candidate
                ));
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Fetch and verify the detached OpenPGP signature.
    async fn verify_signature(
        &self,
        ctx: &FeedContext,
        location: &Location,
        data: &[u8],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        let sig_url = match &location.signature {
            Some(url) => url.clone(),
            None => suffixed_url(&location.url, ".asc")
                .ok_or_else(|| format!("cannot derive signature URL for {}", location.url))?,
        };
        self.pace(ctx).await;
        let body = match fetch(&ctx.client, &sig_url, shutdown).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(()),
            Err(err) => return Err(err),
        };
        let armored = String::from_utf8_lossy(&body);
        let keys = self.keys.keys(&ctx.source_url).await;
        if keys.is_empty() {
            return Err(format!(
                "no OpenPGP keys available to check signature of {}",
                location.url
            ));
        }
        keys.verify_detached(data, &armored)
            .map_err(|err| format!("signature check of {} failed: {err}", location.url))
    }
}

/// Fetch a URL, racing against shutdown. `Ok(None)` means cancelled.
async fn fetch(
    client: &reqwest::Client,
    url: &Url,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Vec<u8>>, String> {
    let request = async {
        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| format!("fetching {url} failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("fetching {url} failed: status {}", response.status()));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|err| format!("reading {url} failed: {err}"))
    };
    tokio::select! {
        result = request => result.map(Some),
        _ = shutdown.changed() => Ok(None),
    }
}

enum HashAlgorithm {
    Sha256,
    Sha512,
}

/// Pick the checksum algorithm from the hash document's URL, falling
/// back to the digest length.
fn hash_algorithm(candidate: &Url, expected: &str) -> Option<HashAlgorithm> {
    let path = candidate.path();
    if path.ends_with(".sha512") {
        return Some(HashAlgorithm::Sha512);
    }
    if path.ends_with(".sha256") {
        return Some(HashAlgorithm::Sha256);
    }
    match expected.len() {
        64 => Some(HashAlgorithm::Sha256),
        128 => Some(HashAlgorithm::Sha512),
        _ => None,
    }
}

/// `<url>.sha512` and `<url>.sha256`, as directory feeds advertise them.
fn derived_hash_urls(url: &Url) -> Vec<Url> {
    [".sha512", ".sha256"]
        .iter()
        .filter_map(|suffix| suffixed_url(url, suffix))
        .collect()
}

fn suffixed_url(url: &Url, suffix: &str) -> Option<Url> {
    Url::parse(&format!("{url}{suffix}")).ok()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
