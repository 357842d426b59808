//! gRPC server shell and interceptor toolkit.
//!
//! The crate provides a server wrapper around the tonic transport plus a set
//! of call interceptors: request-ID propagation, structured logging, panic
//! recovery, Prometheus call metrics, and a throttling gate combining rate
//! limiting and in-flight concurrency limiting with route matching, per-key
//! partitioning, backlog queueing and tag-based rule selection.
//!
//! Interceptors form an async chain around a terminal handler. The chain is
//! message-opaque: it sees the call descriptor, metadata, the call context
//! and the response metadata, never request payloads. [`GateLayer`] mounts a
//! chain onto any tonic service as a tower middleware; [`GrpcServer`]
//! assembles the canonical chain (start-time, request-id, logging, recovery,
//! metrics, user-supplied) and manages the listener lifecycle.

pub mod config;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod layer;
pub mod limit;
pub mod logging;
pub mod server;
pub mod testing;
pub mod throttle;

pub use config::GrpcServerConfig;
pub use context::CallContext;
pub use error::ConfigError;
pub use interceptor::{Call, CallInfo, CallKind, Interceptor, InterceptorChain, Next};
pub use layer::GateLayer;
pub use server::{GrpcServer, ServerOptions};
pub use throttle::{ThrottleConfig, ThrottleInterceptor, ThrottleOptions};
