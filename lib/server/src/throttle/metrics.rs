//! Rejection counters for the throttling gate.

use prometheus::{IntCounterVec, Opts, Registry};

const LABEL_ZONE: &str = "zone";
const LABEL_DRY_RUN: &str = "dry_run";

/// Per-zone rejection counters. Dry-run rejections are counted under their
/// own label value, so rejection rates stay observable before enforcement is
/// switched on.
pub struct ThrottleMetrics {
    rate_limit_rejects: IntCounterVec,
    in_flight_limit_rejects: IntCounterVec,
}

impl ThrottleMetrics {
    pub fn new(namespace: &str) -> Self {
        let opts = |name: &str, help: &str| {
            let mut opts = Opts::new(name, help);
            if !namespace.is_empty() {
                opts = opts.namespace(namespace);
            }
            opts
        };
        Self {
            rate_limit_rejects: IntCounterVec::new(
                opts(
                    "throttle_rate_limit_rejects_total",
                    "Total number of calls rejected by rate-limiting zones.",
                ),
                &[LABEL_ZONE, LABEL_DRY_RUN],
            )
            .expect("rate limit rejects counter"),
            in_flight_limit_rejects: IntCounterVec::new(
                opts(
                    "throttle_in_flight_limit_rejects_total",
                    "Total number of calls rejected by in-flight limiting zones.",
                ),
                &[LABEL_ZONE, LABEL_DRY_RUN],
            )
            .expect("in-flight limit rejects counter"),
        }
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.rate_limit_rejects.clone()))?;
        registry.register(Box::new(self.in_flight_limit_rejects.clone()))?;
        Ok(())
    }

    pub fn unregister(&self, registry: &Registry) {
        let _ = registry.unregister(Box::new(self.rate_limit_rejects.clone()));
        let _ = registry.unregister(Box::new(self.in_flight_limit_rejects.clone()));
    }

    pub fn inc_rate_limit_rejects(&self, zone: &str, dry_run: bool) {
        self.rate_limit_rejects
            .with_label_values(&[zone, dry_run_label(dry_run)])
            .inc();
    }

    pub fn inc_in_flight_limit_rejects(&self, zone: &str, dry_run: bool) {
        self.in_flight_limit_rejects
            .with_label_values(&[zone, dry_run_label(dry_run)])
            .inc();
    }

    pub fn rate_limit_rejects(&self, zone: &str, dry_run: bool) -> u64 {
        self.rate_limit_rejects
            .with_label_values(&[zone, dry_run_label(dry_run)])
            .get()
    }

    pub fn in_flight_limit_rejects(&self, zone: &str, dry_run: bool) -> u64 {
        self.in_flight_limit_rejects
            .with_label_values(&[zone, dry_run_label(dry_run)])
            .get()
    }
}

fn dry_run_label(dry_run: bool) -> &'static str {
    if dry_run {
        "yes"
    } else {
        "no"
    }
}
