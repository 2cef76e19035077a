//! TTL cache of provider OpenPGP keyrings.
//!
//! Same coalesce/sweep semantics as the PMD cache; the TTL comes from
//! the `openpgp_caching` configuration. Loading a keyring first resolves
//! the provider's PMD through the PMD cache.

use crate::pmd_cache::PmdCache;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use scythe_csaf::{Keyring, KeysLoader};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

type SharedLoad = Shared<BoxFuture<'static, Arc<Keyring>>>;

struct Entry {
    load: SharedLoad,
    completed: Arc<OnceLock<Instant>>,
}

/// Cache of keyrings keyed by the provider's PMD URL.
pub(crate) struct KeysCache {
    loader: Arc<dyn KeysLoader>,
    pmd_cache: Arc<PmdCache>,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl KeysCache {
    pub(crate) fn new(loader: Arc<dyn KeysLoader>, pmd_cache: Arc<PmdCache>, ttl: Duration) -> Self {
        Self {
            loader,
            pmd_cache,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the keyring of the provider behind `source_url`. An invalid
    /// PMD yields an empty ring; signature checks then fail loudly
    /// instead of silently passing.
    pub(crate) async fn keys(&self, source_url: &str) -> Arc<Keyring> {
        let load = {
            let mut entries = self.entries.lock().expect("keys cache poisoned");
            match entries.get(source_url) {
                Some(entry) => entry.load.clone(),
                None => {
                    let completed = Arc::new(OnceLock::new());
                    let marker = completed.clone();
                    let loader = self.loader.clone();
                    let pmd_cache = self.pmd_cache.clone();
                    let target = source_url.to_string();
                    let load: SharedLoad = async move {
                        let loaded = pmd_cache.pmd(&target).await;
                        let ring = match &loaded.document {
                            Some(pmd) => loader.load(pmd).await,
                            None => Keyring::empty(),
                        };
                        let _ = marker.set(Instant::now());
                        Arc::new(ring)
                    }
                    .boxed()
                    .shared();
                    entries.insert(
                        source_url.to_string(),
                        Entry {
                            load: load.clone(),
                            completed,
                        },
                    );
                    load
                }
            }
        };
        load.await
    }

    /// Drop entries whose load completed longer than the TTL ago.
    pub(crate) fn sweep(&self) {
        let mut entries = self.entries.lock().expect("keys cache poisoned");
        entries.retain(|_, entry| {
            entry
                .completed
                .get()
                .is_none_or(|done| done.elapsed() <= self.ttl)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scythe_csaf::{LoadedProviderMetadata, PmdLoader, ProviderMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticPmd;

    #[async_trait]
    impl PmdLoader for StaticPmd {
        async fn load(&self, url: &str) -> LoadedProviderMetadata {
            let document: ProviderMetadata = serde_json::from_value(serde_json::json!({
                "canonical_url": "https://example.com/pmd.json",
            }))
            .unwrap();
            LoadedProviderMetadata {
                url: url.to_string(),
                document: Some(document),
                raw: None,
                messages: Vec::new(),
            }
        }
    }

    struct CountingKeys {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl KeysLoader for CountingKeys {
        async fn load(&self, _pmd: &ProviderMetadata) -> Keyring {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Keyring::empty()
        }
    }

    #[tokio::test]
    async fn loads_once_per_cycle() {
        let keys_loader = Arc::new(CountingKeys {
            loads: AtomicUsize::new(0),
        });
        let cache = KeysCache::new(
            keys_loader.clone(),
            Arc::new(PmdCache::new(Arc::new(StaticPmd))),
            Duration::from_secs(60),
        );
        for _ in 0..3 {
            let ring = cache.keys("https://example.com/pmd.json").await;
            assert!(ring.is_empty());
        }
        assert_eq!(keys_loader.loads.load(Ordering::SeqCst), 1);
    }
}
