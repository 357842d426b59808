//! Prometheus call metrics.
//!
//! Owns a duration histogram and an in-flight gauge labelled by service,
//! method and call kind (plus the status code on the histogram). The gauge is
//! decremented on every exit path, including panics unwinding towards the
//! recovery interceptor, so it always returns to zero once traffic drains.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use prometheus::{HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts, Registry};
use tonic::Status;

use super::{code_label, outcome_code, Call, Interceptor, Next};

const LABEL_SERVICE: &str = "grpc_service";
const LABEL_METHOD: &str = "grpc_method";
const LABEL_KIND: &str = "grpc_method_type";
const LABEL_CODE: &str = "grpc_code";

/// Histogram buckets spanning 10 ms to 10 min.
const DEFAULT_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 150.0, 300.0, 600.0,
];

#[derive(Debug, Clone, Default)]
pub struct CallMetricsOptions {
    /// Prefix for both metric names; empty means no prefix.
    pub namespace: String,
    /// Overrides the default duration buckets when non-empty.
    pub duration_buckets: Vec<f64>,
    pub const_labels: HashMap<String, String>,
    /// Full method paths that are not observed at all.
    pub excluded_methods: Vec<String>,
}

/// The metric pair observed by [`MetricsInterceptor`].
pub struct CallMetrics {
    duration: HistogramVec,
    in_flight: IntGaugeVec,
}

impl CallMetrics {
    pub fn new(opts: &CallMetricsOptions) -> Self {
        let buckets = if opts.duration_buckets.is_empty() {
            DEFAULT_DURATION_BUCKETS.to_vec()
        } else {
            opts.duration_buckets.clone()
        };
        let mut histogram_opts =
            HistogramOpts::new("call_duration_seconds", "A histogram of the gRPC call durations.")
                .buckets(buckets)
                .const_labels(opts.const_labels.clone());
        let mut gauge_opts = Opts::new("calls_in_flight", "Current number of in-flight gRPC calls.")
            .const_labels(opts.const_labels.clone());
        if !opts.namespace.is_empty() {
            histogram_opts = histogram_opts.namespace(opts.namespace.clone());
            gauge_opts = gauge_opts.namespace(opts.namespace.clone());
        }

        let duration = HistogramVec::new(
            histogram_opts,
            &[LABEL_SERVICE, LABEL_METHOD, LABEL_KIND, LABEL_CODE],
        )
        .expect("call duration histogram");
        let in_flight = IntGaugeVec::new(gauge_opts, &[LABEL_SERVICE, LABEL_METHOD, LABEL_KIND])
            .expect("calls in flight gauge");
        Self { duration, in_flight }
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.duration.clone()))?;
        registry.register(Box::new(self.in_flight.clone()))?;
        Ok(())
    }

    pub fn unregister(&self, registry: &Registry) {
        let _ = registry.unregister(Box::new(self.in_flight.clone()));
        let _ = registry.unregister(Box::new(self.duration.clone()));
    }

    pub fn in_flight_value(&self, service: &str, method: &str, kind: &str) -> i64 {
        self.in_flight.with_label_values(&[service, method, kind]).get()
    }

    pub fn duration_count(&self, service: &str, method: &str, kind: &str, code: &str) -> u64 {
        self.duration
            .with_label_values(&[service, method, kind, code])
            .get_sample_count()
    }
}

pub struct MetricsInterceptor {
    metrics: Arc<CallMetrics>,
    excluded_methods: Vec<String>,
}

impl MetricsInterceptor {
    pub fn new(metrics: Arc<CallMetrics>, excluded_methods: Vec<String>) -> Self {
        Self {
            metrics,
            excluded_methods,
        }
    }
}

/// Decrements the in-flight gauge on drop, which also covers unwinding.
struct InFlightGuard {
    gauge: IntGauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[async_trait::async_trait]
impl Interceptor for MetricsInterceptor {
    async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status> {
        if self.excluded_methods.iter().any(|m| m == &call.info.full_method) {
            return next.run(call).await;
        }

        let start_time = match call.context.call_start_time() {
            Some(start) => start,
            None => {
                let now = Instant::now();
                call.context.set_call_start_time(now);
                now
            }
        };
        let (service, method) = {
            let (s, m) = call.info.service_and_method();
            (s.to_string(), m.to_string())
        };
        let kind = call.info.kind.as_str();

        let gauge = self
            .metrics
            .in_flight
            .with_label_values(&[&service, &method, kind]);
        gauge.inc();
        let guard = InFlightGuard { gauge };

        let result = next.run(call).await;
        drop(guard);

        let code = code_label(outcome_code(&result));
        self.metrics
            .duration
            .with_label_values(&[&service, &method, kind, code])
            .observe(start_time.elapsed().as_secs_f64());
        result
    }
}
