//! Call interceptor chain.
//!
//! Interceptors wrap a terminal handler and run in order; each one receives
//! the mutable [`Call`] and a [`Next`] continuation. The model is
//! message-opaque on purpose: payloads stay with the transport, interceptors
//! deal in the call descriptor, metadata and context attachments.

pub mod logging;
pub mod metrics;
pub mod recovery;
pub mod request_id;

pub use logging::{LoggingInterceptor, LoggingOptions, LoggingParams};
pub use metrics::{CallMetrics, CallMetricsOptions, MetricsInterceptor};
pub use recovery::RecoveryInterceptor;
pub use request_id::RequestIdInterceptor;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};
use tonic::{Code, Status};

use crate::context::CallContext;

/// Whether a call is a unary RPC or a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    Stream,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Unary => "unary",
            CallKind::Stream => "stream",
        }
    }
}

/// Immutable descriptor of an incoming call.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Full method path in the `/package.Service/Method` form.
    pub full_method: String,
    pub kind: CallKind,
    pub remote_addr: Option<SocketAddr>,
    /// Inbound request metadata.
    pub metadata: MetadataMap,
}

impl CallInfo {
    pub fn new(full_method: impl Into<String>, kind: CallKind) -> Self {
        Self {
            full_method: full_method.into(),
            kind,
            remote_addr: None,
            metadata: MetadataMap::new(),
        }
    }

    /// Splits the full method into service and method names, both falling
    /// back to `"unknown"` when the path is malformed.
    pub fn service_and_method(&self) -> (&str, &str) {
        let trimmed = self.full_method.trim_start_matches('/');
        match trimmed.split_once('/') {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => (service, method),
            _ => ("unknown", "unknown"),
        }
    }

    /// First value of an ASCII metadata entry.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }
}

/// A single in-flight call: descriptor, context attachments, cancellation and
/// the response metadata accumulated by interceptors.
pub struct Call {
    pub info: CallInfo,
    pub context: CallContext,
    cancel: CancellationToken,
    response_metadata: MetadataMap,
}

impl Call {
    pub fn new(info: CallInfo) -> Self {
        Self::with_cancellation(info, CancellationToken::new())
    }

    /// Builds a call whose backlog waits abort when `cancel` fires.
    pub fn with_cancellation(info: CallInfo, cancel: CancellationToken) -> Self {
        Self {
            info,
            context: CallContext::new(),
            cancel,
            response_metadata: MetadataMap::new(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Response metadata to be sent back with the call headers.
    pub fn response_metadata(&self) -> &MetadataMap {
        &self.response_metadata
    }

    pub fn set_response_header(&mut self, name: &str, value: &str) -> Result<(), Status> {
        let key = MetadataKey::<Ascii>::from_bytes(name.as_bytes())
            .map_err(|_| Status::internal(format!("invalid response header name {name:?}")))?;
        let value = MetadataValue::try_from(value)
            .map_err(|_| Status::internal(format!("invalid response header value for {name:?}")))?;
        self.response_metadata.insert(key, value);
        Ok(())
    }
}

/// Terminal handler invoked after every interceptor has passed the call on.
pub type Handler =
    Arc<dyn for<'a> Fn(&'a mut Call) -> BoxFuture<'a, Result<(), Status>> + Send + Sync>;

#[async_trait::async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status>;
}

/// Continuation handed to an interceptor: the rest of the chain plus the
/// terminal handler.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    handler: &'a Handler,
}

impl<'a> Next<'a> {
    pub async fn run(self, call: &mut Call) -> Result<(), Status> {
        match self.rest.split_first() {
            Some((head, tail)) => {
                head.intercept(
                    call,
                    Next {
                        rest: tail,
                        handler: self.handler,
                    },
                )
                .await
            }
            None => (self.handler)(call).await,
        }
    }
}

/// An ordered set of interceptors executable around any handler.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub async fn execute(&self, call: &mut Call, handler: &Handler) -> Result<(), Status> {
        Next {
            rest: &self.interceptors,
            handler,
        }
        .run(call)
        .await
    }
}

/// Stamps the call start time before anything else runs. Mounted first in the
/// canonical chain so that logging and metrics agree on durations.
pub struct CallStartTimeInterceptor;

#[async_trait::async_trait]
impl Interceptor for CallStartTimeInterceptor {
    async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status> {
        call.context.set_call_start_time(Instant::now());
        next.run(call).await
    }
}

/// Canonical name of a gRPC status code, as used in logs and metric labels.
pub fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Status code of a handler outcome: no error maps to `OK`.
pub fn outcome_code(result: &Result<(), Status>) -> Code {
    match result {
        Ok(()) => Code::Ok,
        Err(status) => status.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_call| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    struct Tag(&'static str, Arc<parking_lot::Mutex<Vec<&'static str>>>);

    #[async_trait::async_trait]
    impl Interceptor for Tag {
        async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status> {
            self.1.lock().push(self.0);
            next.run(call).await
        }
    }

    #[tokio::test]
    async fn chain_runs_in_order_then_handler() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(vec![
            Arc::new(Tag("first", order.clone())),
            Arc::new(Tag("second", order.clone())),
        ]);
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = noop_handler(calls.clone());

        let mut call = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        chain.execute(&mut call, &handler).await.unwrap();

        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let chain = InterceptorChain::new(Vec::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = noop_handler(calls.clone());
        let mut call = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        chain.execute(&mut call, &handler).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn service_and_method_split() {
        let info = CallInfo::new("/acme.Files/Upload", CallKind::Unary);
        assert_eq!(info.service_and_method(), ("acme.Files", "Upload"));

        let broken = CallInfo::new("no-slashes", CallKind::Unary);
        assert_eq!(broken.service_and_method(), ("unknown", "unknown"));

        let empty = CallInfo::new("/svc/", CallKind::Unary);
        assert_eq!(empty.service_and_method(), ("unknown", "unknown"));
    }

    #[test]
    fn response_header_roundtrip() {
        let mut call = Call::new(CallInfo::new("/s/m", CallKind::Unary));
        call.set_response_header("x-request-id", "abc").unwrap();
        assert_eq!(
            call.response_metadata().get("x-request-id").unwrap(),
            "abc"
        );
        assert!(call.set_response_header("bad header\n", "v").is_err());
    }
}
