use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::model::{Candidate, InfoHash};

/// How long a cache lookup may block before the engine proceeds as missed.
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub key: String,
}

impl CacheKey {
    fn qualified(&self) -> String {
        format!("{}:{}", self.namespace, self.key)
    }
}

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub value: Value,
    pub created_at: OffsetDateTime,
    pub ttl: Duration,
}

/// The one physical key-value store behind both logical caches.
/// Writes are idempotent upserts.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedEntry>>;
    async fn put(&self, key: CacheKey, value: Value, ttl: Duration) -> Result<()>;
    async fn get_many(&self, keys: &[CacheKey]) -> Result<HashMap<CacheKey, CachedEntry>>;
}

struct PerEntryTtl;

impl moka::Expiry<String, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CachedEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Default in-process backend.
pub struct MemoryCache {
    inner: moka::future::Cache<String, CachedEntry>,
}

impl MemoryCache {
    pub fn new(max_entries: u64) -> Self {
        let inner = moka::future::Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { inner }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedEntry>> {
        Ok(self.inner.get(&key.qualified()).await)
    }

    async fn put(&self, key: CacheKey, value: Value, ttl: Duration) -> Result<()> {
        let entry = CachedEntry {
            value,
            created_at: OffsetDateTime::now_utc(),
            ttl,
        };
        self.inner.insert(key.qualified(), entry).await;
        Ok(())
    }

    async fn get_many(&self, keys: &[CacheKey]) -> Result<HashMap<CacheKey, CachedEntry>> {
        let mut out = HashMap::new();
        for key in keys {
            if let Some(entry) = self.inner.get(&key.qualified()).await {
                out.insert(key.clone(), entry);
            }
        }
        Ok(out)
    }
}

fn scraper_key(scraper: &str, normalized_query: &str, language_key: &str) -> CacheKey {
    let digest = Sha256::digest(format!("{scraper}|{normalized_query}|{language_key}"));
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    CacheKey {
        namespace: "scraper",
        key: hex,
    }
}

fn availability_key(service: &str, hash: &InfoHash) -> CacheKey {
    CacheKey {
        namespace: "debrid-cache",
        key: format!("{service}:{hash}"),
    }
}

/// Typed facade over the store. Backend faults and slow lookups degrade to
/// a miss; hits, misses and write failures are logged.
#[derive(Clone)]
pub struct Caches {
    store: Arc<dyn CacheStore>,
}

impl Caches {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new(10_000)))
    }

    async fn get_guarded(&self, key: &CacheKey) -> Option<CachedEntry> {
        let lookup = tokio::time::timeout(LOOKUP_TIMEOUT, self.store.get(key));
        match lookup.await {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                tracing::warn!(namespace = key.namespace, "Cache backend error: {e}");
                None
            }
            Err(_) => {
                tracing::warn!(namespace = key.namespace, "Cache lookup timed out");
                None
            }
        }
    }

    pub async fn scraper_results(
        &self,
        scraper: &str,
        normalized_query: &str,
        language_key: &str,
    ) -> Option<Vec<Candidate>> {
        let key = scraper_key(scraper, normalized_query, language_key);
        let entry = self.get_guarded(&key).await;
        match entry {
            Some(entry) => match serde_json::from_value(entry.value) {
                Ok(candidates) => {
                    tracing::debug!(scraper, query = normalized_query, "Scraper cache hit");
                    Some(candidates)
                }
                Err(e) => {
                    tracing::warn!(scraper, "Dropping undecodable cache record: {e}");
                    None
                }
            },
            None => {
                tracing::debug!(scraper, query = normalized_query, "Scraper cache miss");
                None
            }
        }
    }

    pub async fn store_scraper_results(
        &self,
        scraper: &str,
        normalized_query: &str,
        language_key: &str,
        candidates: &[Candidate],
        ttl: Duration,
    ) {
        let key = scraper_key(scraper, normalized_query, language_key);
        let value = match serde_json::to_value(candidates) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(scraper, "Failed to serialize cache record: {e}");
                return;
            }
        };
        if let Err(e) = self.store.put(key, value, ttl).await {
            tracing::warn!(scraper, "Cache write failed: {e}");
        }
    }

    /// Batched availability lookup. Absent keys mean "unknown", not "not
    /// cached".
    pub async fn availability(
        &self,
        service: &str,
        hashes: &[InfoHash],
    ) -> HashMap<InfoHash, bool> {
        let keys: Vec<CacheKey> = hashes.iter().map(|h| availability_key(service, h)).collect();
        let lookup = tokio::time::timeout(LOOKUP_TIMEOUT, self.store.get_many(&keys));
        let entries = match lookup.await {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                tracing::warn!(service, "Availability cache error: {e}");
                return HashMap::new();
            }
            Err(_) => {
                tracing::warn!(service, "Availability cache lookup timed out");
                return HashMap::new();
            }
        };
        let mut out = HashMap::new();
        for (hash, key) in hashes.iter().zip(keys) {
            if let Some(entry) = entries.get(&key) {
                if let Some(cached) = entry.value.as_bool() {
                    out.insert(hash.clone(), cached);
                }
            }
        }
        tracing::debug!(
            service,
            hits = out.len(),
            total = hashes.len(),
            "Availability cache lookup"
        );
        out
    }

    pub async fn store_availability(
        &self,
        service: &str,
        hash: &InfoHash,
        cached: bool,
        ttl: Duration,
    ) {
        let key = availability_key(service, hash);
        if let Err(e) = self.store.put(key, Value::Bool(cached), ttl).await {
            tracing::warn!(service, "Availability cache write failed: {e}");
        }
    }
}

/// A backend that always fails; exercised in tests to prove faults degrade
/// to misses.
pub struct BrokenCache;

#[async_trait]
impl CacheStore for BrokenCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CachedEntry>> {
        Err(Error::CacheBackend("backend down".to_string()))
    }

    async fn put(&self, _key: CacheKey, _value: Value, _ttl: Duration) -> Result<()> {
        Err(Error::CacheBackend("backend down".to_string()))
    }

    async fn get_many(&self, _keys: &[CacheKey]) -> Result<HashMap<CacheKey, CachedEntry>> {
        Err(Error::CacheBackend("backend down".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceMeta, TorrentCandidate};
    use std::collections::BTreeSet;

    fn candidate(title: &str) -> Candidate {
        Candidate::Torrent(TorrentCandidate {
            title: title.to_string(),
            info_hash: InfoHash::new("08ada5a7a6183aae1e09d831df6748d566095a10"),
            size: 1234,
            seeders: Some(7),
            tracker: "test".to_string(),
            languages: BTreeSet::new(),
            magnet: None,
            source: SourceMeta::default(),
        })
    }

    #[tokio::test]
    async fn scraper_cache_round_trip() {
        let caches = Caches::in_memory();
        let stored = vec![candidate("Foo.1080p")];
        caches
            .store_scraper_results("tpb", "foo 2019", "en", &stored, Duration::from_secs(60))
            .await;
        let loaded = caches.scraper_results("tpb", "foo 2019", "en").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].title(), "Foo.1080p");
        match &loaded[0] {
            Candidate::Torrent(t) => {
                assert_eq!(t.info_hash.as_ref().unwrap().as_str().len(), 40);
                assert!(!t.info_hash.as_ref().unwrap().is_synthetic());
            }
            rest => panic!("unexpected variant: {rest:?}"),
        }
    }

    #[tokio::test]
    async fn different_language_keys_are_distinct() {
        let caches = Caches::in_memory();
        caches
            .store_scraper_results("tpb", "foo", "en", &[candidate("A")], Duration::from_secs(60))
            .await;
        assert!(caches.scraper_results("tpb", "foo", "fr").await.is_none());
    }

    #[tokio::test]
    async fn availability_round_trip() {
        let caches = Caches::in_memory();
        let hit = InfoHash::new("08ada5a7a6183aae1e09d831df6748d566095a10").unwrap();
        let unknown = InfoHash::new("aaaa5a7a6183aae1e09d831df6748d566095a1aa").unwrap();
        caches
            .store_availability("realdebrid", &hit, true, Duration::from_secs(60))
            .await;
        let map = caches
            .availability("realdebrid", &[hit.clone(), unknown.clone()])
            .await;
        assert_eq!(map.get(&hit), Some(&true));
        assert_eq!(map.get(&unknown), None);
        // A different service does not see the record.
        assert!(caches.availability("alldebrid", &[hit]).await.is_empty());
    }

    #[tokio::test]
    async fn backend_failure_is_a_miss() {
        let caches = Caches::new(Arc::new(BrokenCache));
        caches
            .store_scraper_results("tpb", "foo", "en", &[candidate("A")], Duration::from_secs(60))
            .await;
        assert!(caches.scraper_results("tpb", "foo", "en").await.is_none());
        let hash = InfoHash::new("08ada5a7a6183aae1e09d831df6748d566095a10").unwrap();
        assert!(caches.availability("realdebrid", &[hash]).await.is_empty());
    }
}
