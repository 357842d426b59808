//! gRPC server shell: listener lifecycle, canonical interceptor chain
//! assembly and graceful stop with a hard-stop fallback.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::RwLock;
use prometheus::Registry;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tower::Service;

use crate::config::GrpcServerConfig;
use crate::error::ConfigError;
use crate::interceptor::{
    CallMetrics, CallMetricsOptions, CallStartTimeInterceptor, Interceptor, InterceptorChain,
    LoggingInterceptor, LoggingOptions, MetricsInterceptor, RecoveryInterceptor,
    RequestIdInterceptor,
};
use crate::layer::GateLayer;

/// Construction options beyond the config file: user interceptors appended
/// after the canonical chain, call metrics settings and the set of streaming
/// method paths (the transport cannot tell kinds apart on its own).
#[derive(Default)]
pub struct ServerOptions {
    pub interceptors: Vec<Arc<dyn Interceptor>>,
    pub call_metrics: CallMetricsOptions,
    pub streaming_methods: Vec<String>,
}

/// A tonic server wrapper with the canonical interceptor chain
/// (start-time, request-id, logging, recovery, metrics, user-supplied).
pub struct GrpcServer {
    config: GrpcServerConfig,
    chain: InterceptorChain,
    call_metrics: Arc<CallMetrics>,
    streaming_methods: Vec<String>,
    address: RwLock<String>,
    started: AtomicBool,
    graceful: CancellationToken,
    force: CancellationToken,
    done: CancellationToken,
}

impl GrpcServer {
    pub fn new(config: GrpcServerConfig, options: ServerOptions) -> Result<Self, ConfigError> {
        config.validate()?;

        let call_metrics = Arc::new(CallMetrics::new(&options.call_metrics));
        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(CallStartTimeInterceptor),
            Arc::new(RequestIdInterceptor::new()),
            Arc::new(LoggingInterceptor::new(LoggingOptions {
                call_start: config.log.call_start,
                excluded_methods: config.log.excluded_methods.clone(),
                slow_call_threshold: config.log.slow_call_threshold.0,
                ..Default::default()
            })),
            Arc::new(RecoveryInterceptor::new()),
            Arc::new(MetricsInterceptor::new(
                call_metrics.clone(),
                options.call_metrics.excluded_methods.clone(),
            )),
        ];
        interceptors.extend(options.interceptors);

        let address = config.address.clone();
        Ok(Self {
            config,
            chain: InterceptorChain::new(interceptors),
            call_metrics,
            streaming_methods: options.streaming_methods,
            address: RwLock::new(address),
            started: AtomicBool::new(false),
            graceful: CancellationToken::new(),
            force: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    /// The assembled chain; services that dispatch calls themselves run it
    /// around their handlers.
    pub fn interceptor_chain(&self) -> InterceptorChain {
        self.chain.clone()
    }

    /// The chain as a tower layer, for mounting onto tonic services.
    pub fn layer(&self) -> GateLayer {
        GateLayer::new(self.chain.clone())
            .with_streaming_methods(self.streaming_methods.iter().cloned())
    }

    pub fn call_metrics(&self) -> &Arc<CallMetrics> {
        &self.call_metrics
    }

    pub fn register_metrics(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        self.call_metrics.register(registry)
    }

    pub fn unregister_metrics(&self, registry: &Registry) {
        self.call_metrics.unregister(registry);
    }

    /// The listen address: the configured one until the listener is bound,
    /// then the actual bound address (relevant for port 0).
    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    /// Message-size limits for service builders; tonic scopes these per
    /// service, not per server.
    pub fn max_recv_message_size(&self) -> Option<usize> {
        (self.config.limits.max_recv_message_size > 0)
            .then_some(self.config.limits.max_recv_message_size)
    }

    pub fn max_send_message_size(&self) -> Option<usize> {
        (self.config.limits.max_send_message_size > 0)
            .then_some(self.config.limits.max_send_message_size)
    }

    /// Runs the server on a new task. Fatal errors arrive on `fatal`.
    pub fn spawn<S>(self: &Arc<Self>, service: S, fatal: mpsc::Sender<anyhow::Error>) -> JoinHandle<()>
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let server = self.clone();
        tokio::spawn(async move { server.run(service, fatal).await })
    }

    /// Serves until stopped. Listen and serve failures are delivered on the
    /// `fatal` channel instead of being returned, so a supervising task can
    /// react uniformly.
    pub async fn run<S>(&self, service: S, fatal: mpsc::Sender<anyhow::Error>)
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.started.store(true, Ordering::SeqCst);
        if let Err(err) = self.serve(service).await {
            tracing::error!(error = %err, "gRPC server error");
            let _ = fatal.send(err).await;
        }
        self.done.cancel();
    }

    async fn serve<S>(&self, service: S) -> anyhow::Result<()>
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let mut builder = Server::builder();
        if self.config.tls.enabled {
            let certificate = tokio::fs::read(&self.config.tls.certificate)
                .await
                .with_context(|| {
                    format!("read TLS certificate {:?}", self.config.tls.certificate)
                })?;
            let key = tokio::fs::read(&self.config.tls.key)
                .await
                .with_context(|| format!("read TLS key {:?}", self.config.tls.key))?;
            builder = builder
                .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(certificate, key)))
                .context("configure TLS")?;
        }
        if let Some(time) = self.config.keepalive.time {
            builder = builder.http2_keepalive_interval(Some(time.0));
        }
        if let Some(timeout) = self.config.keepalive.timeout {
            builder = builder.http2_keepalive_timeout(Some(timeout.0));
        }
        if self.config.limits.max_concurrent_streams > 0 {
            builder = builder.max_concurrent_streams(Some(self.config.limits.max_concurrent_streams));
        }

        let router = builder.add_service(service);
        let graceful = self.graceful.clone();

        if let Some(path) = self.config.unix_socket_path.clone() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow::Error::from(err)
                        .context(format!("remove unix socket file {path:?}")));
                }
            }
            let listener =
                UnixListener::bind(&path).with_context(|| format!("listen on {path:?}"))?;
            *self.address.write() = path.display().to_string();
            tracing::info!(address = %self.address(), "starting gRPC server...");
            let incoming = UnixListenerStream::new(listener);
            tokio::select! {
                result = router.serve_with_incoming_shutdown(incoming, graceful.cancelled_owned()) => {
                    result.context("serve on unix socket")?;
                }
                _ = self.force.cancelled() => {}
            }
        } else {
            let listener = TcpListener::bind(&self.config.address)
                .await
                .with_context(|| format!("listen on {:?}", self.config.address))?;
            if let Ok(local_addr) = listener.local_addr() {
                *self.address.write() = local_addr.to_string();
            }
            tracing::info!(address = %self.address(), "starting gRPC server...");
            let incoming = TcpListenerStream::new(listener);
            tokio::select! {
                result = router.serve_with_incoming_shutdown(incoming, graceful.cancelled_owned()) => {
                    result.context("serve")?;
                }
                _ = self.force.cancelled() => {}
            }
        }
        Ok(())
    }

    /// Stops the server and waits for the serve task to return. Graceful mode
    /// lets outstanding calls finish within the shutdown timeout, then stops
    /// hard; forceful mode cuts them immediately.
    pub async fn stop(&self, gracefully: bool) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        if !gracefully {
            tracing::info!("stopping gRPC server...");
            self.force.cancel();
            self.done.cancelled().await;
            return;
        }

        let timeout = self.config.timeouts.shutdown.0;
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "stopping gRPC server gracefully...");
        self.graceful.cancel();
        if tokio::time::timeout(timeout, self.done.cancelled()).await.is_err() {
            tracing::info!("gRPC server graceful stop timed out, stopping forcefully...");
            self.force.cancel();
            self.done.cancelled().await;
        } else {
            tracing::info!("gRPC server gracefully stopped");
        }
    }
}
