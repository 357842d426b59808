//! Tower layer mounting an [`InterceptorChain`] onto a tonic service.
//!
//! The layer translates each HTTP/2 request into a [`Call`] (method path,
//! metadata, peer address), runs the chain with the inner service as the
//! terminal handler, and merges the response metadata accumulated by the
//! interceptors into the outgoing headers. A chain rejection short-circuits
//! the inner service and is rendered as a trailers-only gRPC response.
//!
//! Method kinds are not visible at this layer; paths listed in
//! `streaming_methods` are marked as streams, everything else as unary.

use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{HeaderValue, Request, Response};
use parking_lot::Mutex;
use tonic::metadata::MetadataMap;
use tonic::transport::server::TcpConnectInfo;
use tonic::Status;
use tower::{Layer, Service};

use crate::interceptor::{Call, CallInfo, CallKind, Handler, InterceptorChain};

#[derive(Clone)]
pub struct GateLayer {
    chain: InterceptorChain,
    streaming_methods: Arc<HashSet<String>>,
}

impl GateLayer {
    pub fn new(chain: InterceptorChain) -> Self {
        Self {
            chain,
            streaming_methods: Arc::new(HashSet::new()),
        }
    }

    /// Marks the given full method paths as streaming calls.
    pub fn with_streaming_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.streaming_methods = Arc::new(methods.into_iter().collect());
        self
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            chain: self.chain.clone(),
            streaming_methods: self.streaming_methods.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GateService<S> {
    inner: S,
    chain: InterceptorChain,
    streaming_methods: Arc<HashSet<String>>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GateService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Take the readied service and leave a fresh clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let chain = self.chain.clone();
        let streaming_methods = self.streaming_methods.clone();

        Box::pin(async move {
            let full_method = request.uri().path().to_string();
            let kind = if streaming_methods.contains(&full_method) {
                CallKind::Stream
            } else {
                CallKind::Unary
            };
            let mut info = CallInfo::new(full_method, kind);
            info.remote_addr = request
                .extensions()
                .get::<TcpConnectInfo>()
                .and_then(|connect| connect.remote_addr());
            info.metadata = MetadataMap::from_headers(request.headers().clone());
            let mut call = Call::new(info);

            // The inner service and the request ride into the terminal
            // handler through a slot; the response comes back the same way.
            type InState<S, B> = Arc<Mutex<Option<(S, Request<B>)>>>;
            let in_state: InState<S, ReqBody> = Arc::new(Mutex::new(Some((inner, request))));
            let out_state: Arc<Mutex<Option<Result<Response<ResBody>, S::Error>>>> =
                Arc::new(Mutex::new(None));
            let handler: Handler = {
                let in_state = in_state.clone();
                let out_state = out_state.clone();
                Arc::new(move |_call: &mut Call| {
                    let in_state = in_state.clone();
                    let out_state = out_state.clone();
                    Box::pin(async move {
                        let Some((mut inner, request)) = in_state.lock().take() else {
                            return Err(Status::internal("call handler invoked twice"));
                        };
                        let result = inner.call(request).await;
                        let failed = result.is_err();
                        *out_state.lock() = Some(result);
                        if failed {
                            // Surfaced to the transport below; the chain only
                            // needs to know the handler did not succeed.
                            Err(Status::unknown("transport error"))
                        } else {
                            Ok(())
                        }
                    })
                })
            };

            let chain_result = chain.execute(&mut call, &handler).await;
            let response_metadata = call.response_metadata().clone();
            let inner_result = out_state.lock().take();

            match inner_result {
                // The inner service ran; its verdict wins over the synthetic
                // status the handler reported to the chain.
                Some(Ok(mut response)) => {
                    merge_metadata(response.headers_mut(), &response_metadata);
                    Ok(response)
                }
                Some(Err(err)) => Err(err),
                // The chain short-circuited before the inner service ran.
                None => {
                    let status = match chain_result {
                        Err(status) => status,
                        Ok(()) => Status::internal("interceptor chain skipped the handler"),
                    };
                    Ok(status_response(&status, &response_metadata))
                }
            }
        })
    }
}

fn merge_metadata(headers: &mut http::HeaderMap, metadata: &MetadataMap) {
    for (name, value) in metadata.clone().into_headers().iter() {
        headers.insert(name.clone(), value.clone());
    }
}

/// Renders a chain rejection as a trailers-only gRPC response.
fn status_response<B: Default>(status: &Status, metadata: &MetadataMap) -> Response<B> {
    let mut response = Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    merge_metadata(headers, metadata);
    headers.insert("grpc-status", HeaderValue::from(status.code() as i32));
    if !status.message().is_empty() {
        if let Ok(value) = HeaderValue::from_str(status.message()) {
            headers.insert("grpc-message", value);
        }
    }
    response
}
