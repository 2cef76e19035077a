//! TTL cache of loaded provider-metadata documents.
//!
//! Lookups for the same URL coalesce on one in-flight load: the cache
//! stores a shared future, so exactly one network fetch happens per URL
//! per expiry cycle. The manager sweeps expired entries once per loop
//! pass; lookups themselves may come from any task.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use scythe_csaf::{LoadedProviderMetadata, PmdLoader};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// How long a loaded PMD stays usable.
const PMD_TTL: Duration = Duration::from_secs(15 * 60);

type SharedLoad = Shared<BoxFuture<'static, Arc<LoadedProviderMetadata>>>;

struct Entry {
    load: SharedLoad,
    /// Set when the load finished; the TTL counts from here.
    completed: Arc<OnceLock<Instant>>,
}

/// Cache of provider-metadata documents keyed by URL.
pub(crate) struct PmdCache {
    loader: Arc<dyn PmdLoader>,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl PmdCache {
    pub(crate) fn new(loader: Arc<dyn PmdLoader>) -> Self {
        Self::with_ttl(loader, PMD_TTL)
    }

    pub(crate) fn with_ttl(loader: Arc<dyn PmdLoader>, ttl: Duration) -> Self {
        Self {
            loader,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the PMD for a URL, loading it at most once per expiry cycle.
    /// Always yields a result; callers inspect `is_valid()`/`messages`.
    pub(crate) async fn pmd(&self, url: &str) -> Arc<LoadedProviderMetadata> {
        let load = {
            let mut entries = self.entries.lock().expect("pmd cache poisoned");
            match entries.get(url) {
                Some(entry) => entry.load.clone(),
                None => {
                    let completed = Arc::new(OnceLock::new());
                    let marker = completed.clone();
                    let loader = self.loader.clone();
                    let target = url.to_string();
                    let load: SharedLoad = async move {
                        let loaded = Arc::new(loader.load(&target).await);
                        let _ = marker.set(Instant::now());
                        loaded
                    }
                    .boxed()
                    .shared();
                    entries.insert(
                        url.to_string(),
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
        let mut entries = self.entries.lock().expect("pmd cache poisoned");
        entries.retain(|_, entry| {
            entry
                .completed
                .get()
                .is_none_or(|done| done.elapsed() <= self.ttl)
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl PmdLoader for CountingLoader {
        async fn load(&self, url: &str) -> LoadedProviderMetadata {
            self.loads.fetch_add(1, Ordering::SeqCst);
            // Yield once so concurrent lookups really overlap.
            tokio::task::yield_now().await;
            LoadedProviderMetadata {
                url: url.to_string(),
                document: None,
                raw: None,
                messages: vec!["test loader".to_string()],
            }
        }
    }

    #[tokio::test]
    async fn concurrent_lookups_coalesce() {
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
        });
        let cache = Arc::new(PmdCache::new(loader.clone()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.pmd("https://example.com/pmd.json").await
            }));
        }
        for handle in handles {
            let loaded = handle.await.unwrap();
            assert_eq!(loaded.url, "https://example.com/pmd.json");
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sweep_expires_completed_entries() {
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
        });
        let cache = PmdCache::with_ttl(loader.clone(), Duration::ZERO);
        cache.pmd("https://example.com/pmd.json").await;
        assert_eq!(cache.len(), 1);
        cache.sweep();
        assert_eq!(cache.len(), 0);
        // A fresh lookup loads again.
        cache.pmd("https://example.com/pmd.json").await;
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }
}
