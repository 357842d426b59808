//! Request rate limiting.
//!
//! Two algorithms behind one trait: GCRA (leaky bucket) keeps a single
//! theoretical-arrival-time per key; the sliding window interpolates between
//! two adjacent fixed windows. Per-key state lives in an LRU zone bounded by
//! `max_keys`; with no key extractor a single shared state is used.
//!
//! The engine wrapper resolves the key, consults the limiter, and on
//! rejection either fails fast, passes through in dry-run mode, or parks the
//! call in a bounded per-key backlog that re-checks admission on the
//! limiter's retry hints.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Deserialize;
use tollgate_cache::LruCache;
use tonic::Status;

use super::key::KeyExtractor;
use super::{set_retry_after_header, CallNext, SlotPool};
use crate::error::ConfigError;
use crate::interceptor::{Call, Interceptor, Next};

/// Default bound on the number of tracked keys.
pub const DEFAULT_RATE_LIMIT_MAX_KEYS: usize = 10_000;

/// Default time a call may spend parked in the backlog.
pub const DEFAULT_RATE_LIMIT_BACKLOG_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests per duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub count: usize,
    pub duration: Duration,
}

impl Rate {
    pub fn per_second(count: usize) -> Self {
        Self {
            count,
            duration: Duration::from_secs(1),
        }
    }

    pub fn per_minute(count: usize) -> Self {
        Self {
            count,
            duration: Duration::from_secs(60),
        }
    }

    pub fn per_hour(count: usize) -> Self {
        Self {
            count,
            duration: Duration::from_secs(3600),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after: Duration,
}

impl Decision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    fn rejected(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Admission contract shared by the rate-limiting algorithms.
///
/// `allow` never suspends; only the engine's backlog waiting does.
pub trait RateLimiter: Send + Sync {
    fn allow(&self, key: &str) -> anyhow::Result<Decision>;
}

/// Supported rate-limiting algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlg {
    #[default]
    LeakyBucket,
    SlidingWindow,
}

enum KeyedCells<T> {
    Single(Arc<Mutex<T>>),
    PerKey(LruCache<String, Arc<Mutex<T>>>),
}

impl<T: Send + Sync + 'static> KeyedCells<T> {
    fn new(max_keys: usize, init: T) -> Result<Self, ConfigError>
    where
        T: Clone,
    {
        if max_keys == 0 {
            Ok(Self::Single(Arc::new(Mutex::new(init))))
        } else {
            Ok(Self::PerKey(
                LruCache::new(max_keys, None).map_err(|_| ConfigError::InvalidMaxKeys)?,
            ))
        }
    }

    fn cell(&self, key: &str, init: impl FnOnce() -> T) -> Arc<Mutex<T>> {
        match self {
            Self::Single(cell) => cell.clone(),
            Self::PerKey(cache) => {
                cache
                    .get_or_add(key.to_string(), || Arc::new(Mutex::new(init())))
                    .0
            }
        }
    }
}

/// GCRA leaky bucket: per key, a theoretical arrival time advanced by the
/// emission interval on every admission, with a burst allowance `tau`.
pub struct LeakyBucketLimiter {
    emission_interval: Duration,
    tau: Duration,
    start: Instant,
    cells: KeyedCells<Duration>,
}

impl LeakyBucketLimiter {
    pub fn new(max_rate: Rate, max_burst: usize, max_keys: usize) -> Result<Self, ConfigError> {
        validate_rate(max_rate)?;
        let burst = u32::try_from(max_burst)
            .map_err(|_| ConfigError::InvalidRate(format!("burst {max_burst} is too large")))?;
        let emission_interval = max_rate.duration / max_rate.count as u32;
        let tau = emission_interval * burst;
        Ok(Self {
            emission_interval,
            tau,
            start: Instant::now(),
            cells: KeyedCells::new(max_keys, Duration::ZERO)?,
        })
    }

    fn check(&self, tat: &mut Duration, now: Duration) -> Decision {
        if *tat <= now + self.tau {
            *tat = (*tat).max(now) + self.emission_interval;
            Decision::allowed()
        } else {
            Decision::rejected(*tat - self.tau - now)
        }
    }
}

impl RateLimiter for LeakyBucketLimiter {
    fn allow(&self, key: &str) -> anyhow::Result<Decision> {
        let now = self.start.elapsed();
        let cell = self.cells.cell(key, || now);
        let mut tat = cell.lock();
        Ok(self.check(&mut tat, now))
    }
}

struct WindowState {
    window_start_ms: u64,
    prev: u64,
    curr: u64,
}

/// Sliding window: two adjacent fixed windows per key, with the previous
/// window's count weighted by the remaining fraction of the current one.
pub struct SlidingWindowLimiter {
    max_rate: Rate,
    window_ms: u64,
    cells: KeyedCells<WindowState>,
}

impl SlidingWindowLimiter {
    pub fn new(max_rate: Rate, max_keys: usize) -> Result<Self, ConfigError> {
        validate_rate(max_rate)?;
        let window_ms = max_rate.duration.as_millis() as u64;
        if window_ms == 0 {
            return Err(ConfigError::InvalidRate(
                "rate duration must be at least 1ms".to_string(),
            ));
        }
        if max_keys == 0 {
            return Ok(Self {
                max_rate,
                window_ms,
                cells: KeyedCells::Single(Arc::new(Mutex::new(WindowState {
                    window_start_ms: 0,
                    prev: 0,
                    curr: 0,
                }))),
            });
        }
        Ok(Self {
            max_rate,
            window_ms,
            cells: KeyedCells::PerKey(
                LruCache::new(max_keys, None).map_err(|_| ConfigError::InvalidMaxKeys)?,
            ),
        })
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn allow(&self, key: &str) -> anyhow::Result<Decision> {
        let now_ms = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64;
        let window_start = now_ms - now_ms % self.window_ms;
        let cell = self.cells.cell(key, || WindowState {
            window_start_ms: window_start,
            prev: 0,
            curr: 0,
        });
        let mut state = cell.lock();

        if state.window_start_ms != window_start {
            if state.window_start_ms + self.window_ms == window_start {
                state.prev = state.curr;
            } else {
                state.prev = 0;
            }
            state.curr = 0;
            state.window_start_ms = window_start;
        }

        let elapsed = (now_ms - window_start) as f64;
        let estimate =
            state.prev as f64 * (1.0 - elapsed / self.window_ms as f64) + state.curr as f64;
        if estimate < self.max_rate.count as f64 {
            state.curr += 1;
            return Ok(Decision::allowed());
        }
        Ok(Decision::rejected(Duration::from_millis(
            self.window_ms - elapsed as u64,
        )))
    }
}

fn validate_rate(rate: Rate) -> Result<(), ConfigError> {
    if rate.count == 0 {
        return Err(ConfigError::InvalidRate("count must be greater than 0".to_string()));
    }
    if rate.duration.is_zero() {
        return Err(ConfigError::InvalidRate("duration must be greater than 0".to_string()));
    }
    if u32::try_from(rate.count).is_err() {
        return Err(ConfigError::InvalidRate(format!("count {} is too large", rate.count)));
    }
    Ok(())
}

/// Data handed to the rejection and error policies.
#[derive(Debug, Clone)]
pub struct RateLimitParams {
    pub key: String,
    pub backlogged: bool,
    pub estimated_retry_after: Duration,
}

impl RateLimitParams {
    fn new(key: impl Into<String>, backlogged: bool, estimated_retry_after: Duration) -> Self {
        Self {
            key: key.into(),
            backlogged,
            estimated_retry_after,
        }
    }
}

pub type RateLimitOnReject = Arc<dyn Fn(&mut Call, &RateLimitParams) -> Status + Send + Sync>;
pub type RateLimitOnRejectInDryRun = Arc<dyn Fn(&mut Call, &RateLimitParams) + Send + Sync>;
pub type RateLimitOnError =
    Arc<dyn Fn(&mut Call, &RateLimitParams, &anyhow::Error) -> Status + Send + Sync>;

#[derive(Clone, Default)]
pub struct RateLimitOptions {
    pub alg: RateLimitAlg,
    /// Burst allowance for the leaky bucket.
    pub max_burst: usize,
    pub get_key: Option<KeyExtractor>,
    /// Bound on tracked keys; zero picks [`DEFAULT_RATE_LIMIT_MAX_KEYS`].
    /// Ignored without a key extractor.
    pub max_keys: usize,
    /// Check limits but never reject. Backlogging is disabled so calls never
    /// block.
    pub dry_run: bool,
    pub backlog_limit: usize,
    /// Defaults to [`DEFAULT_RATE_LIMIT_BACKLOG_TIMEOUT`] when zero.
    pub backlog_timeout: Duration,
    pub on_reject: Option<RateLimitOnReject>,
    pub on_reject_in_dry_run: Option<RateLimitOnRejectInDryRun>,
    pub on_error: Option<RateLimitOnError>,
}

/// The rate-limiting engine: key resolution, admission, dry-run and backlog.
pub struct RateLimitHandler {
    limiter: Arc<dyn RateLimiter>,
    get_key: Option<KeyExtractor>,
    backlog: Option<SlotPool>,
    backlog_timeout: Duration,
    dry_run: bool,
    on_reject: RateLimitOnReject,
    on_reject_in_dry_run: RateLimitOnRejectInDryRun,
    on_error: RateLimitOnError,
}

impl RateLimitHandler {
    pub fn new(max_rate: Rate, opts: RateLimitOptions) -> Result<Self, ConfigError> {
        let backlog_limit = if opts.dry_run { 0 } else { opts.backlog_limit };
        let max_keys = match &opts.get_key {
            Some(_) if opts.max_keys == 0 => DEFAULT_RATE_LIMIT_MAX_KEYS,
            Some(_) => opts.max_keys,
            None => 0,
        };

        let limiter: Arc<dyn RateLimiter> = match opts.alg {
            RateLimitAlg::LeakyBucket => {
                Arc::new(LeakyBucketLimiter::new(max_rate, opts.max_burst, max_keys)?)
            }
            RateLimitAlg::SlidingWindow => Arc::new(SlidingWindowLimiter::new(max_rate, max_keys)?),
        };
        let backlog = if backlog_limit > 0 {
            Some(SlotPool::new(backlog_limit, max_keys)?)
        } else {
            None
        };
        let backlog_timeout = if opts.backlog_timeout.is_zero() {
            DEFAULT_RATE_LIMIT_BACKLOG_TIMEOUT
        } else {
            opts.backlog_timeout
        };

        Ok(Self {
            limiter,
            get_key: opts.get_key,
            backlog,
            backlog_timeout,
            dry_run: opts.dry_run,
            on_reject: opts.on_reject.unwrap_or_else(|| Arc::new(default_on_reject)),
            on_reject_in_dry_run: opts
                .on_reject_in_dry_run
                .unwrap_or_else(|| Arc::new(default_on_reject_in_dry_run)),
            on_error: opts.on_error.unwrap_or_else(|| Arc::new(default_on_error)),
        })
    }

    pub async fn handle<'a>(&self, call: &'a mut Call, proceed: CallNext<'a>) -> Result<(), Status> {
        let mut key = String::new();
        if let Some(get_key) = &self.get_key {
            let extraction = match get_key(call) {
                Ok(extraction) => extraction,
                Err(err) => {
                    let err = err.context("get key for rate limit");
                    let params = RateLimitParams::new("", false, Duration::ZERO);
                    return Err((self.on_error)(call, &params, &err));
                }
            };
            if extraction.bypass {
                return proceed(call).await;
            }
            key = extraction.key;
        }

        let decision = match self.limiter.allow(&key) {
            Ok(decision) => decision,
            Err(err) => {
                let err = err.context("rate limit");
                let params = RateLimitParams::new(key, false, Duration::ZERO);
                return Err((self.on_error)(call, &params, &err));
            }
        };

        if decision.allowed {
            return proceed(call).await;
        }

        if self.dry_run {
            let params = RateLimitParams::new(key, false, decision.retry_after);
            (self.on_reject_in_dry_run)(call, &params);
            return proceed(call).await;
        }

        let Some(backlog) = &self.backlog else {
            let params = RateLimitParams::new(key, false, decision.retry_after);
            return Err((self.on_reject)(call, &params));
        };
        self.handle_backlogged(call, proceed, key, decision.retry_after, backlog)
            .await
    }

    async fn handle_backlogged<'a>(
        &self,
        call: &'a mut Call,
        proceed: CallNext<'a>,
        key: String,
        mut retry_after: Duration,
        backlog: &SlotPool,
    ) -> Result<(), Status> {
        let slots = backlog.get(&key);
        let Ok(permit) = slots.try_acquire_owned() else {
            // No free backlog slots, reject immediately.
            let params = RateLimitParams::new(key, false, retry_after);
            return Err((self.on_reject)(call, &params));
        };
        let mut permit = Some(permit);
        let cancel = call.cancellation().clone();
        let backlog_deadline = tokio::time::Instant::now() + self.backlog_timeout;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(retry_after) => {
                    // Time for another admission check.
                }
                _ = tokio::time::sleep_until(backlog_deadline) => {
                    drop(permit.take());
                    let params = RateLimitParams::new(key, true, retry_after);
                    return Err((self.on_reject)(call, &params));
                }
                _ = cancel.cancelled() => {
                    drop(permit.take());
                    let params = RateLimitParams::new(key, true, retry_after);
                    let err = anyhow::anyhow!("call cancelled while waiting in backlog");
                    return Err((self.on_error)(call, &params, &err));
                }
            }

            match self.limiter.allow(&key) {
                Err(err) => {
                    drop(permit.take());
                    let err = err.context("rate limit");
                    let params = RateLimitParams::new(key, true, retry_after);
                    return Err((self.on_error)(call, &params, &err));
                }
                Ok(decision) if decision.allowed => {
                    drop(permit.take());
                    return proceed(call).await;
                }
                Ok(decision) => retry_after = decision.retry_after,
            }
        }
    }
}

pub fn default_on_reject(call: &mut Call, params: &RateLimitParams) -> Status {
    if let Some(logger) = call.context.logger() {
        tracing::warn!(
            parent: logger,
            rate_limit_key = %params.key,
            request_backlogged = params.backlogged,
            estimated_retry_after_ms = params.estimated_retry_after.as_millis() as i64,
            "rate limit exceeded"
        );
    }
    set_retry_after_header(call, params.estimated_retry_after);
    Status::resource_exhausted("Too many requests")
}

pub fn default_on_reject_in_dry_run(call: &mut Call, params: &RateLimitParams) {
    if let Some(logger) = call.context.logger() {
        tracing::warn!(
            parent: logger,
            rate_limit_key = %params.key,
            "rate limit exceeded, continuing in dry run mode"
        );
    }
}

pub fn default_on_error(call: &mut Call, params: &RateLimitParams, err: &anyhow::Error) -> Status {
    if let Some(logger) = call.context.logger() {
        tracing::error!(
            parent: logger,
            rate_limit_key = %params.key,
            error = %err,
            "rate limiting error"
        );
    }
    Status::internal("Internal server error")
}

/// Chain interceptor form of the engine.
pub struct RateLimitInterceptor {
    handler: RateLimitHandler,
}

impl RateLimitInterceptor {
    pub fn new(max_rate: Rate, opts: RateLimitOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            handler: RateLimitHandler::new(max_rate, opts)?,
        })
    }
}

#[async_trait::async_trait]
impl Interceptor for RateLimitInterceptor {
    async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status> {
        self.handler
            .handle(call, Box::new(move |call| Box::pin(next.run(call))))
            .await
    }
}
