//! Cache metrics registration.
//!
//! Shared caches register a collector per cache when the facade is built and
//! unregister it on shutdown, so reopening a repository on the same registry
//! does not trip over stale registrations.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntGauge, Opts, Registry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::traits::StatsSource;

/// Destination for cache gauges.
pub trait MetricsSink: Send + Sync {
    /// Start exporting the stats of the cache called `name`.
    fn register_cache(&self, name: &str, source: Arc<dyn StatsSource>);

    /// Stop exporting the cache called `name`. Unknown names are ignored.
    fn unregister_cache(&self, name: &str);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn register_cache(&self, _name: &str, _source: Arc<dyn StatsSource>) {}

    fn unregister_cache(&self, _name: &str) {}
}

/// Gauges for one cache, refreshed from its stats on every scrape.
#[derive(Clone)]
struct CacheCollector {
    source: Arc<dyn StatsSource>,
    size: IntGauge,
    hits: IntGauge,
    misses: IntGauge,
    evictions: IntGauge,
}

impl CacheCollector {
    fn new(name: &str, source: Arc<dyn StatsSource>) -> prometheus::Result<Self> {
        let gauge = |metric: &str, help: &str| {
            IntGauge::with_opts(Opts::new(metric, help).const_label("cache", name))
        };
        Ok(Self {
            source,
            size: gauge("vellum_cache_size", "Number of entries in the cache")?,
            hits: gauge("vellum_cache_hits", "Cache hits since start")?,
            misses: gauge("vellum_cache_misses", "Cache misses since start")?,
            evictions: gauge("vellum_cache_evictions", "Entries dropped by expiry or capacity")?,
        })
    }

    fn gauges(&self) -> [&IntGauge; 4] {
        [&self.size, &self.hits, &self.misses, &self.evictions]
    }
}

impl Collector for CacheCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.gauges().into_iter().flat_map(|g| g.desc()).collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let stats = self.source.stats();
        self.size.set(stats.entry_count as i64);
        self.hits.set(stats.hits as i64);
        self.misses.set(stats.misses as i64);
        self.evictions.set(stats.evictions as i64);
        self.gauges().into_iter().flat_map(|g| g.collect()).collect()
    }
}

/// Prometheus-backed sink.
#[derive(Clone)]
pub struct PrometheusMetricsSink {
    registry: Registry,
    collectors: Arc<Mutex<HashMap<String, CacheCollector>>>,
}

impl PrometheusMetricsSink {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            collectors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Names of the caches currently registered through this sink.
    pub fn registered(&self) -> Vec<String> {
        self.collectors
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn register_cache(&self, name: &str, source: Arc<dyn StatsSource>) {
        let collector = match CacheCollector::new(name, source) {
            Ok(collector) => collector,
            Err(e) => {
                tracing::warn!(cache = name, error = %e, "Failed to build cache gauges");
                return;
            }
        };
        if let Err(e) = self.registry.register(Box::new(collector.clone())) {
            tracing::warn!(cache = name, error = %e, "Failed to register cache gauges");
            return;
        }
        if let Ok(mut collectors) = self.collectors.lock() {
            collectors.insert(name.to_string(), collector);
        }
    }

    fn unregister_cache(&self, name: &str) {
        let collector = match self.collectors.lock() {
            Ok(mut collectors) => collectors.remove(name),
            Err(_) => None,
        };
        if let Some(collector) = collector {
            if let Err(e) = self.registry.unregister(Box::new(collector)) {
                tracing::warn!(cache = name, error = %e, "Failed to unregister cache gauges");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::traits::CacheStats;

    struct FixedStats(CacheStats);

    impl StatsSource for FixedStats {
        fn stats(&self) -> CacheStats {
            self.0
        }
    }

    fn exposition(registry: &Registry) -> String {
        prometheus::TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap()
    }

    #[test]
    fn test_register_exports_current_stats() {
        let sink = PrometheusMetricsSink::new(Registry::new());
        let stats = CacheStats {
            hits: 7,
            misses: 3,
            entry_count: 5,
            evictions: 1,
        };
        sink.register_cache("repo.state", Arc::new(FixedStats(stats)));

        let text = exposition(sink.registry());
        assert!(text.contains(r#"vellum_cache_size{cache="repo.state"} 5"#));
        assert!(text.contains(r#"vellum_cache_hits{cache="repo.state"} 7"#));
        assert!(text.contains(r#"vellum_cache_evictions{cache="repo.state"} 1"#));
        assert_eq!(sink.registered(), vec!["repo.state".to_string()]);
    }

    #[test]
    fn test_unregister_allows_reregistration() {
        let sink = PrometheusMetricsSink::new(Registry::new());
        let source: Arc<dyn StatsSource> = Arc::new(FixedStats(CacheStats::default()));

        sink.register_cache("repo.state", Arc::clone(&source));
        sink.unregister_cache("repo.state");
        assert!(!exposition(sink.registry()).contains("vellum_cache_size"));

        sink.register_cache("repo.state", source);
        assert_eq!(sink.registered().len(), 1);
        assert!(exposition(sink.registry()).contains("vellum_cache_size"));
    }
}
