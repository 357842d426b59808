//! Cache usage statistics.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Hook for collecting cache usage statistics.
pub trait MetricsCollector: Send + Sync {
    /// Called on every lookup that found a live entry.
    fn inc_hits(&self);
    /// Called on every lookup that found nothing or an expired entry.
    fn inc_misses(&self);
    /// Called when the number of stored entries changes.
    fn set_amount(&self, amount: usize);
    /// Called when entries are evicted due to capacity pressure.
    fn add_evictions(&self, count: usize);
}

pub(crate) struct DisabledMetrics;

impl MetricsCollector for DisabledMetrics {
    fn inc_hits(&self) {}
    fn inc_misses(&self) {}
    fn set_amount(&self, _amount: usize) {}
    fn add_evictions(&self, _count: usize) {}
}

/// Prometheus-backed [`MetricsCollector`].
pub struct PrometheusMetrics {
    hits: IntCounter,
    misses: IntCounter,
    amount: IntGauge,
    evictions: IntCounter,
}

impl PrometheusMetrics {
    /// Creates the metric set. `namespace` may be empty.
    pub fn new(namespace: &str) -> Self {
        let opts = |name: &str, help: &str| {
            let mut opts = Opts::new(name, help);
            if !namespace.is_empty() {
                opts = opts.namespace(namespace);
            }
            opts
        };
        Self {
            hits: IntCounter::with_opts(opts("cache_hits_total", "Total number of cache hits."))
                .expect("cache hits counter"),
            misses: IntCounter::with_opts(opts("cache_misses_total", "Total number of cache misses."))
                .expect("cache misses counter"),
            amount: IntGauge::with_opts(opts("cache_entries_amount", "Current number of cache entries."))
                .expect("cache entries gauge"),
            evictions: IntCounter::with_opts(opts(
                "cache_evicted_total",
                "Total number of entries evicted due to capacity pressure.",
            ))
            .expect("cache evictions counter"),
        }
    }

    /// Registers all metrics in `registry`.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.hits.clone()))?;
        registry.register(Box::new(self.misses.clone()))?;
        registry.register(Box::new(self.amount.clone()))?;
        registry.register(Box::new(self.evictions.clone()))?;
        Ok(())
    }

    /// Unregisters all metrics from `registry`.
    pub fn unregister(&self, registry: &Registry) {
        let _ = registry.unregister(Box::new(self.hits.clone()));
        let _ = registry.unregister(Box::new(self.misses.clone()));
        let _ = registry.unregister(Box::new(self.amount.clone()));
        let _ = registry.unregister(Box::new(self.evictions.clone()));
    }

    pub fn hits_total(&self) -> u64 {
        self.hits.get()
    }

    pub fn misses_total(&self) -> u64 {
        self.misses.get()
    }

    pub fn entries_amount(&self) -> i64 {
        self.amount.get()
    }

    pub fn evictions_total(&self) -> u64 {
        self.evictions.get()
    }
}

impl MetricsCollector for PrometheusMetrics {
    fn inc_hits(&self) {
        self.hits.inc();
    }

    fn inc_misses(&self) {
        self.misses.inc();
    }

    fn set_amount(&self, amount: usize) {
        self.amount.set(amount as i64);
    }

    fn add_evictions(&self, count: usize) {
        self.evictions.inc_by(count as u64);
    }
}
