//! Per-call context attachments.
//!
//! The context is a type-indexed bag carried by [`crate::Call`] through the
//! interceptor chain. Each logical attachment lives under a module-private
//! key type, so unrelated interceptors cannot collide.

use std::sync::Arc;
use std::time::Instant;

use http::Extensions;
use tracing::Span;

use crate::interceptor::logging::LoggingParams;

#[derive(Clone)]
struct RequestId(Arc<str>);

#[derive(Clone)]
struct InternalRequestId(Arc<str>);

#[derive(Clone, Copy)]
struct CallStartTime(Instant);

#[derive(Clone)]
struct Logger(Span);

#[derive(Clone)]
struct Params(Arc<LoggingParams>);

#[derive(Clone)]
struct AccessToken(Arc<str>);

/// Key/value attachments that travel with a single call.
#[derive(Default)]
pub struct CallContext {
    ext: Extensions,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// External correlation ID. Never changes once set.
    pub fn request_id(&self) -> Option<&str> {
        self.ext.get::<RequestId>().map(|v| v.0.as_ref())
    }

    pub fn set_request_id(&mut self, id: impl Into<Arc<str>>) {
        self.ext.insert(RequestId(id.into()));
    }

    /// Internal correlation ID, minted fresh for every call.
    pub fn int_request_id(&self) -> Option<&str> {
        self.ext.get::<InternalRequestId>().map(|v| v.0.as_ref())
    }

    pub fn set_int_request_id(&mut self, id: impl Into<Arc<str>>) {
        self.ext.insert(InternalRequestId(id.into()));
    }

    pub fn call_start_time(&self) -> Option<Instant> {
        self.ext.get::<CallStartTime>().map(|v| v.0)
    }

    pub fn set_call_start_time(&mut self, start: Instant) {
        self.ext.insert(CallStartTime(start));
    }

    /// Per-call logger installed by the logging interceptor.
    pub fn logger(&self) -> Option<&Span> {
        self.ext.get::<Logger>().map(|v| &v.0)
    }

    pub fn set_logger(&mut self, span: Span) {
        self.ext.insert(Logger(span));
    }

    /// Accumulator for fields the handler wants on the final call log.
    pub fn logging_params(&self) -> Option<&Arc<LoggingParams>> {
        self.ext.get::<Params>().map(|v| &v.0)
    }

    pub fn set_logging_params(&mut self, params: Arc<LoggingParams>) {
        self.ext.insert(Params(params));
    }

    pub fn access_token(&self) -> Option<&str> {
        self.ext.get::<AccessToken>().map(|v| v.0.as_ref())
    }

    pub fn set_access_token(&mut self, token: impl Into<Arc<str>>) {
        self.ext.insert(AccessToken(token.into()));
    }
}
