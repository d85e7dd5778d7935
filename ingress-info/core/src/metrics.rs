use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Counters describing how the host database is built and cached.
#[derive(Clone, Debug, Default)]
pub struct DbMetrics {
    pub(crate) builds: Counter,
    pub(crate) build_failures: Counter,
    pub(crate) hosts: Gauge,
    pub(crate) cache_hits: Counter,
    pub(crate) cache_misses: Counter,
    pub(crate) cache_errors: Counter,
}

impl DbMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "builds",
            "Count of host database builds",
            metrics.builds.clone(),
        );
        prom.register(
            "build_failures",
            "Count of host database builds that failed to list Ingresses",
            metrics.build_failures.clone(),
        );
        prom.register(
            "hosts",
            "Number of unique hosts in the most recently built database",
            metrics.hosts.clone(),
        );
        prom.register(
            "cache_hits",
            "Count of requests served from a cached database",
            metrics.cache_hits.clone(),
        );
        prom.register(
            "cache_misses",
            "Count of requests that required a database build",
            metrics.cache_misses.clone(),
        );
        prom.register(
            "cache_errors",
            "Count of cache storage failures",
            metrics.cache_errors.clone(),
        );

        metrics
    }

    pub fn builds(&self) -> u64 {
        self.builds.get()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.get()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.get()
    }

    pub fn cache_errors(&self) -> u64 {
        self.cache_errors.get()
    }
}
