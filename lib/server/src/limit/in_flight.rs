//! In-flight concurrency limiting.
//!
//! Per key, admissions are permits of a bounded semaphore. A call that finds
//! no free permit may park in a second, backlog semaphore and wait for an
//! admission slot to free up, bounded by the backlog timeout and call
//! cancellation. Permits are released on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tonic::Status;

use super::key::KeyExtractor;
use super::{CallNext, SlotPool};
use crate::error::ConfigError;
use crate::interceptor::{Call, Interceptor, Next};

/// Default bound on the number of tracked keys.
pub const DEFAULT_IN_FLIGHT_LIMIT_MAX_KEYS: usize = 10_000;

/// Default time a call may spend parked in the backlog.
pub const DEFAULT_IN_FLIGHT_LIMIT_BACKLOG_TIMEOUT: Duration = Duration::from_secs(5);

/// Data handed to the rejection and error policies.
#[derive(Debug, Clone)]
pub struct InFlightLimitParams {
    pub key: String,
    pub backlogged: bool,
}

impl InFlightLimitParams {
    fn new(key: impl Into<String>, backlogged: bool) -> Self {
        Self {
            key: key.into(),
            backlogged,
        }
    }
}

pub type InFlightLimitOnReject =
    Arc<dyn Fn(&mut Call, &InFlightLimitParams) -> Status + Send + Sync>;
pub type InFlightLimitOnRejectInDryRun =
    Arc<dyn Fn(&mut Call, &InFlightLimitParams) + Send + Sync>;
pub type InFlightLimitOnError =
    Arc<dyn Fn(&mut Call, &InFlightLimitParams, &anyhow::Error) -> Status + Send + Sync>;

#[derive(Clone, Default)]
pub struct InFlightLimitOptions {
    pub get_key: Option<KeyExtractor>,
    /// Bound on tracked keys; zero picks [`DEFAULT_IN_FLIGHT_LIMIT_MAX_KEYS`].
    /// Ignored without a key extractor.
    pub max_keys: usize,
    /// Admit everything but still report would-be rejections.
    pub dry_run: bool,
    pub backlog_limit: usize,
    /// Defaults to [`DEFAULT_IN_FLIGHT_LIMIT_BACKLOG_TIMEOUT`] when zero.
    pub backlog_timeout: Duration,
    pub on_reject: Option<InFlightLimitOnReject>,
    pub on_reject_in_dry_run: Option<InFlightLimitOnRejectInDryRun>,
    pub on_error: Option<InFlightLimitOnError>,
}

/// The in-flight limiting engine.
pub struct InFlightLimitHandler {
    slots: SlotPool,
    backlog: Option<SlotPool>,
    get_key: Option<KeyExtractor>,
    backlog_timeout: Duration,
    dry_run: bool,
    on_reject: InFlightLimitOnReject,
    on_reject_in_dry_run: InFlightLimitOnRejectInDryRun,
    on_error: InFlightLimitOnError,
}

impl InFlightLimitHandler {
    pub fn new(limit: usize, opts: InFlightLimitOptions) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidInFlightLimit);
        }
        let backlog_limit = if opts.dry_run { 0 } else { opts.backlog_limit };
        let max_keys = match &opts.get_key {
            Some(_) if opts.max_keys == 0 => DEFAULT_IN_FLIGHT_LIMIT_MAX_KEYS,
            Some(_) => opts.max_keys,
            None => 0,
        };
        let backlog = if backlog_limit > 0 {
            Some(SlotPool::new(backlog_limit, max_keys)?)
        } else {
            None
        };
        let backlog_timeout = if opts.backlog_timeout.is_zero() {
            DEFAULT_IN_FLIGHT_LIMIT_BACKLOG_TIMEOUT
        } else {
            opts.backlog_timeout
        };

        Ok(Self {
            slots: SlotPool::new(limit, max_keys)?,
            backlog,
            get_key: opts.get_key,
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
                    let err = err.context("get key for in-flight limit");
                    let params = InFlightLimitParams::new("", false);
                    return Err((self.on_error)(call, &params, &err));
                }
            };
            if extraction.bypass {
                return proceed(call).await;
            }
            key = extraction.key;
        }

        let admission = self.slots.get(&key);
        if let Ok(permit) = admission.clone().try_acquire_owned() {
            let result = proceed(call).await;
            drop(permit);
            return result;
        }

        if self.dry_run {
            let params = InFlightLimitParams::new(key, false);
            (self.on_reject_in_dry_run)(call, &params);
            return proceed(call).await;
        }

        let Some(backlog_pool) = &self.backlog else {
            let params = InFlightLimitParams::new(key, false);
            return Err((self.on_reject)(call, &params));
        };
        let Ok(backlog_permit) = backlog_pool.get(&key).try_acquire_owned() else {
            // No free backlog slots, reject immediately.
            let params = InFlightLimitParams::new(key, false);
            return Err((self.on_reject)(call, &params));
        };

        let cancel = call.cancellation().clone();
        tokio::select! {
            acquired = admission.acquire_owned() => {
                drop(backlog_permit);
                match acquired {
                    Ok(permit) => {
                        let result = proceed(call).await;
                        drop(permit);
                        result
                    }
                    Err(_) => {
                        let params = InFlightLimitParams::new(key, true);
                        let err = anyhow::anyhow!("in-flight slots are closed");
                        Err((self.on_error)(call, &params, &err))
                    }
                }
            }
            _ = tokio::time::sleep(self.backlog_timeout) => {
                drop(backlog_permit);
                let params = InFlightLimitParams::new(key, true);
                Err((self.on_reject)(call, &params))
            }
            _ = cancel.cancelled() => {
                drop(backlog_permit);
                let params = InFlightLimitParams::new(key, true);
                let err = anyhow::anyhow!("call cancelled while waiting in backlog");
                Err((self.on_error)(call, &params, &err))
            }
        }
    }
}

pub fn default_on_reject(call: &mut Call, params: &InFlightLimitParams) -> Status {
    if let Some(logger) = call.context.logger() {
        tracing::warn!(
            parent: logger,
            in_flight_limit_key = %params.key,
            request_backlogged = params.backlogged,
            "in-flight limit exceeded"
        );
    }
    Status::resource_exhausted("Too many in-flight requests")
}

pub fn default_on_reject_in_dry_run(call: &mut Call, params: &InFlightLimitParams) {
    if let Some(logger) = call.context.logger() {
        tracing::warn!(
            parent: logger,
            in_flight_limit_key = %params.key,
            "in-flight limit exceeded, continuing in dry run mode"
        );
    }
}

pub fn default_on_error(
    call: &mut Call,
    params: &InFlightLimitParams,
    err: &anyhow::Error,
) -> Status {
    if let Some(logger) = call.context.logger() {
        tracing::error!(
            parent: logger,
            in_flight_limit_key = %params.key,
            error = %err,
            "in-flight limiting error"
        );
    }
    Status::internal("Internal server error")
}

/// Chain interceptor form of the engine.
pub struct InFlightLimitInterceptor {
    handler: InFlightLimitHandler,
}

impl InFlightLimitInterceptor {
    pub fn new(limit: usize, opts: InFlightLimitOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            handler: InFlightLimitHandler::new(limit, opts)?,
        })
    }
}

#[async_trait::async_trait]
impl Interceptor for InFlightLimitInterceptor {
    async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status> {
        self.handler
            .handle(call, Box::new(move |call| Box::pin(next.run(call))))
            .await
    }
}
