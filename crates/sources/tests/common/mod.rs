//! Shared fixtures for the manager integration tests.
//!
//! The tests need a real Postgres; set SCYTHE_TEST_DATABASE_URL to run
//! them, otherwise they skip. HTTP traffic goes against httpmock
//! servers, never the network.

use async_trait::async_trait;
use scythe_core::config::{DatabaseConfig, SourcesConfig};
use scythe_csaf::{
    DocumentStore, Keyring, KeysLoader, LoadedProviderMetadata, PmdLoader, ProviderMetadata,
    StoreError,
};
use scythe_db::Database;
use scythe_sources::{Manager, SourceManager};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

static NAME_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A name that is unique across tests and test runs sharing a database.
pub fn unique_name(prefix: &str) -> String {
    let counter = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{}", std::process::id(), counter)
}

/// Connect to the test database, skipping the test when none is
/// configured. A configured but unreachable database is a failure.
pub async fn database_or_skip() -> Option<Database> {
    let Ok(url) = std::env::var("SCYTHE_TEST_DATABASE_URL") else {
        eprintln!("Skipping Postgres test (SCYTHE_TEST_DATABASE_URL not set)");
        return None;
    };
    let cfg = DatabaseConfig {
        url,
        max_connections: 5,
    };
    let db = Database::connect(&cfg)
        .await
        .expect("connecting to the test database failed");
    db.ensure_schema().await.expect("preparing schema failed");
    Some(db)
}

/// Serves one fixed PMD for every URL.
pub struct StaticPmdLoader {
    pub pmd: ProviderMetadata,
}

#[async_trait]
impl PmdLoader for StaticPmdLoader {
    async fn load(&self, url: &str) -> LoadedProviderMetadata {
        LoadedProviderMetadata {
            url: url.to_string(),
            document: Some(self.pmd.clone()),
            raw: None,
            messages: Vec::new(),
        }
    }
}

/// Never finds any keys.
pub struct NoKeysLoader;

#[async_trait]
impl KeysLoader for NoKeysLoader {
    async fn load(&self, _pmd: &ProviderMetadata) -> Keyring {
        Keyring::empty()
    }
}

/// In-memory advisory store recording what was persisted.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Option<OffsetDateTime>>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.docs.lock().unwrap().contains_key(url)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn is_current(
        &self,
        url: &Url,
        changed: Option<OffsetDateTime>,
    ) -> Result<bool, StoreError> {
        let docs = self.docs.lock().unwrap();
        Ok(match docs.get(url.as_str()) {
            None => false,
            Some(stored) => match (stored, changed) {
                (Some(stored), Some(advertised)) => *stored >= advertised,
                _ => true,
            },
        })
    }

    async fn store(
        &self,
        _source_id: i64,
        _feed_id: i64,
        url: &Url,
        _document: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.docs
            .lock()
            .unwrap()
            .insert(url.to_string(), Some(OffsetDateTime::now_utc()));
        Ok(())
    }
}

/// A PMD advertising the given ROLIE feeds and directory trees.
pub fn pmd_with_feeds(rolie_urls: &[&str], directory_urls: &[&str]) -> ProviderMetadata {
    let feeds: Vec<serde_json::Value> = rolie_urls
        .iter()
        .map(|u| serde_json::json!({ "url": u }))
        .collect();
    let mut distributions = vec![serde_json::json!({ "rolie": { "feeds": feeds } })];
    for dir in directory_urls {
        distributions.push(serde_json::json!({ "directory_url": dir }));
    }
    serde_json::from_value(serde_json::json!({
        "canonical_url": "https://example.com/.well-known/csaf/provider-metadata.json",
        "distributions": distributions,
    }))
    .expect("static PMD must parse")
}

/// A running manager plus everything needed to talk to and stop it.
pub struct Harness {
    pub handle: SourceManager,
    pub store: Arc<MemoryStore>,
    pub shutdown: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

impl Harness {
    /// Spawn a manager with an empty catalogue.
    pub async fn spawn(db: Database, cfg: SourcesConfig, pmd: ProviderMetadata) -> Self {
        let store = Arc::new(MemoryStore::default());
        let (manager, handle) = Manager::new(
            cfg,
            db,
            Arc::new(StaticPmdLoader { pmd }),
            Arc::new(NoKeysLoader),
            None,
            store.clone(),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(shutdown_rx));
        Self {
            handle,
            store,
            shutdown,
            task,
        }
    }

    /// Stop the manager and wait for the workers to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Poll until `cond` holds or the timeout passes.
pub async fn wait_until<F>(timeout: std::time::Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    cond()
}

/// Default test configuration: quiet, fast, no signature checks.
pub fn test_config(secret: &str) -> SourcesConfig {
    SourcesConfig {
        download_slots: 4,
        max_slots_per_source: 2,
        feed_refresh_secs: 3600,
        signature_check: false,
        strict_mode: false,
        encryption_secret: secret.to_string(),
        ..SourcesConfig::default()
    }
}
