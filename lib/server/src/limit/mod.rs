//! Admission limiting engines: request rate (leaky bucket and sliding
//! window) and in-flight concurrency, both with per-key partitioning and
//! backlog queueing.

pub mod in_flight;
pub mod key;
pub mod rate;

pub use in_flight::{
    InFlightLimitHandler, InFlightLimitInterceptor, InFlightLimitOptions, InFlightLimitParams,
};
pub use key::{KeyExtraction, KeyExtractor};
pub use rate::{
    Decision, LeakyBucketLimiter, Rate, RateLimitAlg, RateLimitHandler, RateLimitInterceptor,
    RateLimitOptions, RateLimitParams, RateLimiter, SlidingWindowLimiter,
};

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tollgate_cache::LruCache;
use tonic::Status;

use crate::error::ConfigError;
use crate::interceptor::Call;

/// Continuation invoked by a limiting engine once the call is admitted.
pub type CallNext<'a> =
    Box<dyn FnOnce(&'a mut Call) -> BoxFuture<'a, Result<(), Status>> + Send + 'a>;

/// Semaphores of a fixed capacity, either shared or partitioned per key in an
/// LRU-bounded zone. Entries are created lazily on first use and evicted by
/// recency once `max_keys` is exceeded.
pub(crate) struct SlotPool {
    capacity: usize,
    state: SlotPoolState,
}

enum SlotPoolState {
    Single(Arc<Semaphore>),
    PerKey(LruCache<String, Arc<Semaphore>>),
}

impl SlotPool {
    pub(crate) fn new(capacity: usize, max_keys: usize) -> Result<Self, ConfigError> {
        let state = if max_keys == 0 {
            SlotPoolState::Single(Arc::new(Semaphore::new(capacity)))
        } else {
            SlotPoolState::PerKey(
                LruCache::new(max_keys, None).map_err(|_| ConfigError::InvalidMaxKeys)?,
            )
        };
        Ok(Self { capacity, state })
    }

    pub(crate) fn get(&self, key: &str) -> Arc<Semaphore> {
        match &self.state {
            SlotPoolState::Single(semaphore) => semaphore.clone(),
            SlotPoolState::PerKey(cache) => {
                let capacity = self.capacity;
                cache
                    .get_or_add(key.to_string(), || Arc::new(Semaphore::new(capacity)))
                    .0
            }
        }
    }
}

/// Sets the `retry-after` response header in integer ceiling seconds.
pub(crate) fn set_retry_after_header(call: &mut Call, retry_after: Duration) {
    let seconds = retry_after.as_secs_f64().ceil() as u64;
    if let Err(status) = call.set_response_header("retry-after", &seconds.to_string()) {
        if let Some(logger) = call.context.logger() {
            tracing::warn!(parent: logger, error = %status, "failed to set retry-after header");
        }
    }
}
