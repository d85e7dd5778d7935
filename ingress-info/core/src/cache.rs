use crate::{
    build::{self, Builder, ListIngresses},
    hosts::IngressDb,
    metrics::DbMetrics,
};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// The single key under which the host database is cached.
pub const INGRESS_DB_KEY: &str = "INGRESS_DB";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
}

/// Keyed storage with per-entry expiration.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Returns the value stored under `key` unless it is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Arc<IngressDb>>, StoreError>;

    /// Stores `db` under `key`, replacing any previous value, until `ttl`
    /// elapses.
    async fn set(&self, key: &str, db: Arc<IngressDb>, ttl: Duration) -> Result<(), StoreError>;

    /// False for stores that never hold anything, so that callers can skip
    /// them (and their hit/miss accounting) entirely.
    fn is_caching(&self) -> bool {
        true
    }
}

/// A store that never holds anything. Used when caching is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStore(());

/// A process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<AHashMap<String, Entry>>,
}

#[derive(Clone, Debug)]
struct Entry {
    db: Arc<IngressDb>,
    /// `None` when the TTL reaches past what the clock can represent.
    expires_at: Option<Instant>,
}

/// Serves the host database from a [`Store`], building it on a miss.
///
/// Concurrent misses may each run a build; the last one to finish is what
/// remains stored.
pub struct CachedDb<L> {
    builder: Builder<L>,
    store: Arc<dyn Store>,
    ttl: Duration,
    metrics: DbMetrics,
}

// === impl NoopStore ===

#[async_trait::async_trait]
impl Store for NoopStore {
    async fn get(&self, _: &str) -> Result<Option<Arc<IngressDb>>, StoreError> {
        Ok(None)
    }

    async fn set(&self, _: &str, _: Arc<IngressDb>, _: Duration) -> Result<(), StoreError> {
        Ok(())
    }

    fn is_caching(&self) -> bool {
        false
    }
}

// === impl MemoryStore ===

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Arc<IngressDb>>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.read().get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.db.clone()));
            }
        } else {
            return Ok(None);
        }

        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, db: Arc<IngressDb>, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now().checked_add(ttl);
        self.entries
            .write()
            .insert(key.to_string(), Entry { db, expires_at });
        Ok(())
    }
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

// === impl CachedDb ===

impl<L: ListIngresses> CachedDb<L> {
    pub fn new(builder: Builder<L>, store: Arc<dyn Store>, ttl: Duration, metrics: DbMetrics) -> Self {
        Self {
            builder,
            store,
            ttl,
            metrics,
        }
    }

    /// Builds on every call.
    pub fn uncached(builder: Builder<L>, metrics: DbMetrics) -> Self {
        Self::new(builder, Arc::new(NoopStore::default()), Duration::ZERO, metrics)
    }

    /// Returns the cached database if it is still fresh; otherwise builds
    /// and stores a new one.
    ///
    /// Storage failures are logged and fall back to a direct build. Only
    /// build failures are returned.
    pub async fn get(&self) -> Result<Arc<IngressDb>, build::Error> {
        if !self.store.is_caching() {
            return self.builder.build().await.map(Arc::new);
        }

        match self.store.get(INGRESS_DB_KEY).await {
            Ok(Some(db)) => {
                trace!(hosts = db.len(), "Serving cached host database");
                self.metrics.cache_hits.inc();
                return Ok(db);
            }
            Ok(None) => {
                self.metrics.cache_misses.inc();
            }
            Err(error) => {
                warn!(%error, "Failed to read cached host database");
                self.metrics.cache_errors.inc();
                self.metrics.cache_misses.inc();
            }
        }

        let db = Arc::new(self.builder.build().await?);
        match self.store.set(INGRESS_DB_KEY, db.clone(), self.ttl).await {
            Ok(()) => debug!(hosts = db.len(), ttl = ?self.ttl, "Stored host database"),
            Err(error) => {
                warn!(%error, "Failed to store host database");
                self.metrics.cache_errors.inc();
            }
        }
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{
        tests::{mk_ingress, FakeCluster},
        DbConfig,
    };
    use tokio::time;

    const TTL: Duration = Duration::from_secs(60);

    fn cached(
        cluster: &Arc<FakeCluster>,
        store: Arc<dyn Store>,
    ) -> (CachedDb<Arc<FakeCluster>>, DbMetrics) {
        let metrics = DbMetrics::default();
        let builder = Builder::new(
            cluster.clone(),
            Arc::new(DbConfig::default()),
            metrics.clone(),
        );
        (CachedDb::new(builder, store, TTL, metrics.clone()), metrics)
    }

    fn hosts(db: &IngressDb) -> Vec<String> {
        db.hosts().map(Into::into).collect()
    }

    /// A store whose backing storage is unavailable.
    struct BrokenStore;

    #[async_trait::async_trait]
    impl Store for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<Arc<IngressDb>>, StoreError> {
            Err(std::io::Error::other("disk unavailable").into())
        }

        async fn set(&self, _: &str, _: Arc<IngressDb>, _: Duration) -> Result<(), StoreError> {
            Err(std::io::Error::other("disk unavailable").into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serves_cached_db_until_ttl_elapses() {
        let cluster = FakeCluster::new(vec![mk_ingress("ns-0", "a", None, Some("a.example.com"))]);
        let (cache, metrics) = cached(&cluster, Arc::new(MemoryStore::default()));

        let first = cache.get().await.unwrap();
        assert_eq!(hosts(&first), vec!["a.example.com"]);
        assert_eq!(cluster.calls(), 1);

        // Changes in the cluster are not visible while the entry is fresh.
        cluster.apply(mk_ingress("ns-0", "b", None, Some("b.example.com")));
        time::advance(TTL - Duration::from_secs(1)).await;
        let second = cache.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cluster.calls(), 1);
        assert_eq!(metrics.cache_hits(), 1);

        // Exactly at expiry the database is rebuilt.
        time::advance(Duration::from_secs(1)).await;
        let third = cache.get().await.unwrap();
        assert_eq!(hosts(&third), vec!["a.example.com", "b.example.com"]);
        assert_eq!(cluster.calls(), 2);
        assert_eq!(metrics.cache_misses(), 2);
        assert_eq!(metrics.builds(), 2);
    }

    #[tokio::test]
    async fn uncached_builds_every_time() {
        let cluster = FakeCluster::new(vec![mk_ingress("ns-0", "a", None, Some("a.example.com"))]);
        let metrics = DbMetrics::default();
        let builder = Builder::new(
            cluster.clone(),
            Arc::new(DbConfig::default()),
            metrics.clone(),
        );
        let cache = CachedDb::uncached(builder, metrics.clone());

        for _ in 0..3 {
            cache.get().await.unwrap();
        }
        assert_eq!(cluster.calls(), 3);
        assert_eq!(metrics.builds(), 3);
        assert_eq!(metrics.cache_hits(), 0);
        assert_eq!(metrics.cache_misses(), 0);
        assert_eq!(metrics.cache_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_ttl_never_expires() {
        let cluster = FakeCluster::new(vec![mk_ingress("ns-0", "a", None, Some("a.example.com"))]);
        let metrics = DbMetrics::default();
        let builder = Builder::new(
            cluster.clone(),
            Arc::new(DbConfig::default()),
            metrics.clone(),
        );
        let cache = CachedDb::new(
            builder,
            Arc::new(MemoryStore::default()),
            Duration::from_secs(u64::MAX),
            metrics.clone(),
        );

        let first = cache.get().await.unwrap();
        assert_eq!(hosts(&first), vec!["a.example.com"]);

        time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        let second = cache.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cluster.calls(), 1);
        assert_eq!(metrics.cache_hits(), 1);
    }

    #[tokio::test]
    async fn storage_failure_falls_back_to_building() {
        let cluster = FakeCluster::new(vec![mk_ingress("ns-0", "a", None, Some("a.example.com"))]);
        let (cache, metrics) = cached(&cluster, Arc::new(BrokenStore));

        let db = cache.get().await.unwrap();
        assert_eq!(hosts(&db), vec!["a.example.com"]);
        cache.get().await.unwrap();
        assert_eq!(cluster.calls(), 2);
        // One read failure and one write failure per request.
        assert_eq!(metrics.cache_errors(), 4);
    }

    #[tokio::test]
    async fn build_failures_are_not_cached() {
        let cluster = FakeCluster::new(vec![mk_ingress("ns-0", "a", None, Some("a.example.com"))]);
        cluster.fail_namespace("ns-0");
        let metrics = DbMetrics::default();
        let builder = Builder::new(
            cluster.clone(),
            Arc::new(DbConfig {
                namespaces: Some(vec!["ns-0".to_string()]),
                ..Default::default()
            }),
            metrics.clone(),
        );
        let store = Arc::new(MemoryStore::default());
        let cache = CachedDb::new(builder, store.clone(), TTL, metrics);

        assert!(cache.get().await.is_err());
        assert!(store.get(INGRESS_DB_KEY).await.unwrap().is_none());
        assert!(cache.get().await.is_err());
        assert_eq!(cluster.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_build_at_least_once() {
        let cluster = FakeCluster::new(vec![mk_ingress("ns-0", "a", None, Some("a.example.com"))]);
        let (cache, _) = cached(&cluster, Arc::new(MemoryStore::default()));

        let (a, b) = tokio::join!(cache.get(), cache.get());
        assert_eq!(a.unwrap(), b.unwrap());
        let calls = cluster.calls();
        assert!((1..=2).contains(&calls), "{calls}");

        cache.get().await.unwrap();
        assert_eq!(cluster.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_store_expires_entries() {
        let store = MemoryStore::default();
        let db = Arc::new(["a.example.com"].into_iter().collect::<IngressDb>());
        store.set("k", db.clone(), TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(db));
        assert_eq!(store.get("other").await.unwrap(), None);

        time::advance(TTL).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.entries.read().is_empty());
    }
}
