//! Structured call logging.
//!
//! On entry the interceptor builds a per-call `tracing` span carrying the
//! correlation IDs and the common call fields, optionally emits a "started"
//! event, and installs a logger plus a [`LoggingParams`] accumulator into the
//! call context. On exit it emits the finish event with the resolved status
//! code, duration, and whatever the handler accumulated along the way. Slow
//! calls additionally surface `slow_request=true` and the collected time
//! slots.
//!
//! Excluded methods suppress the "started" event unconditionally and the
//! finish event only for successful calls: failures are always logged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::Span;

use super::{code_label, outcome_code, Call, CallInfo, Interceptor, Next};
use crate::context::CallContext;

const DEFAULT_SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(1);

/// Returns a custom base logger for a call, or `None` to keep the default.
pub type LoggerProvider = Arc<dyn Fn(&CallInfo, &CallContext) -> Option<Span> + Send + Sync>;

#[derive(Clone)]
pub struct LoggingOptions {
    /// Emit an info-level "gRPC call started" event on entry.
    pub call_start: bool,
    /// Metadata headers to log, mapped to log field names.
    pub call_headers: HashMap<String, String>,
    /// Full method paths whose successful calls are not logged.
    pub excluded_methods: Vec<String>,
    /// Install the fully enriched logger into the context, so downstream
    /// events carry the call fields too.
    pub add_call_info_to_logger: bool,
    /// Calls at least this long are flagged with `slow_request=true`.
    pub slow_call_threshold: Duration,
    pub custom_logger_provider: Option<LoggerProvider>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            call_start: false,
            call_headers: HashMap::new(),
            excluded_methods: Vec::new(),
            add_call_info_to_logger: false,
            slow_call_threshold: DEFAULT_SLOW_CALL_THRESHOLD,
            custom_logger_provider: None,
        }
    }
}

/// Concurrent-safe accumulator surfaced on the final call log.
///
/// Handlers fetch it from the call context and attach extra fields or account
/// time spent in named phases of the call.
#[derive(Default)]
pub struct LoggingParams {
    inner: Mutex<LoggingParamsInner>,
}

#[derive(Default)]
struct LoggingParamsInner {
    fields: Vec<(String, serde_json::Value)>,
    time_slots: BTreeMap<String, i64>,
}

impl LoggingParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends fields to the final call log. Append-only.
    pub fn extend_fields<I>(&self, fields: I)
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        self.inner.lock().fields.extend(fields);
    }

    /// Accounts `millis` against the named slot, accumulating across calls.
    pub fn add_time_slot(&self, name: &str, millis: i64) {
        let mut inner = self.inner.lock();
        *inner.time_slots.entry(name.to_string()).or_insert(0) += millis;
    }

    pub fn fields(&self) -> Vec<(String, serde_json::Value)> {
        self.inner.lock().fields.clone()
    }

    pub fn time_slots(&self) -> BTreeMap<String, i64> {
        self.inner.lock().time_slots.clone()
    }
}

pub struct LoggingInterceptor {
    opts: LoggingOptions,
}

impl LoggingInterceptor {
    pub fn new(opts: LoggingOptions) -> Self {
        Self { opts }
    }
}

#[async_trait::async_trait]
impl Interceptor for LoggingInterceptor {
    async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status> {
        let start_time = match call.context.call_start_time() {
            Some(start) => start,
            None => {
                let now = Instant::now();
                call.context.set_call_start_time(now);
                now
            }
        };

        let request_id = call.context.request_id().unwrap_or_default().to_string();
        let int_request_id = call.context.int_request_id().unwrap_or_default().to_string();
        let trace_id = trace_id_from_metadata(&call.info.metadata).unwrap_or_default();

        // The custom provider replaces the base logger for this call; the
        // correlation IDs and call fields are layered on top of it.
        let base = self
            .opts
            .custom_logger_provider
            .as_ref()
            .and_then(|provider| provider(&call.info, &call.context));
        let span = self.build_call_span(call, base.as_ref(), &request_id, &int_request_id, &trace_id);

        let excluded = is_logging_disabled(&call.info.full_method, &self.opts.excluded_methods);
        if self.opts.call_start && !excluded {
            tracing::info!(parent: &span, "gRPC call started");
        }

        let params = Arc::new(LoggingParams::new());
        call.context.set_logging_params(params.clone());
        let logger_for_next = if self.opts.add_call_info_to_logger {
            span.clone()
        } else {
            match &base {
                Some(parent) => tracing::info_span!(
                    parent: parent,
                    "grpc_call",
                    request_id = %request_id,
                    int_request_id = %int_request_id,
                    trace_id = %trace_id,
                ),
                None => tracing::info_span!(
                    "grpc_call",
                    request_id = %request_id,
                    int_request_id = %int_request_id,
                    trace_id = %trace_id,
                ),
            }
        };
        call.context.set_logger(logger_for_next);

        let result = next.run(call).await;

        let duration = start_time.elapsed();
        let code = outcome_code(&result);
        if !excluded || code != Code::Ok {
            self.log_call_completion(&span, &params, duration, &result, code);
        }
        result
    }
}

impl LoggingInterceptor {
    fn build_call_span(
        &self,
        call: &Call,
        base: Option<&Span>,
        request_id: &str,
        int_request_id: &str,
        trace_id: &str,
    ) -> Span {
        let (service, method) = call.info.service_and_method();
        let remote_addr = call
            .info
            .remote_addr
            .map(|a| a.to_string())
            .unwrap_or_default();
        let user_agent = call.info.user_agent().unwrap_or_default();

        let span = match base {
            Some(parent) => tracing::info_span!(
                parent: parent,
                "grpc_call",
                request_id = %request_id,
                int_request_id = %int_request_id,
                trace_id = %trace_id,
                grpc_service = %service,
                grpc_method = %method,
                grpc_method_type = call.info.kind.as_str(),
                remote_addr = %remote_addr,
                user_agent = %user_agent,
                remote_addr_ip = tracing::field::Empty,
                remote_addr_port = tracing::field::Empty,
                call_headers = tracing::field::Empty,
            ),
            None => tracing::info_span!(
                "grpc_call",
                request_id = %request_id,
                int_request_id = %int_request_id,
                trace_id = %trace_id,
                grpc_service = %service,
                grpc_method = %method,
                grpc_method_type = call.info.kind.as_str(),
                remote_addr = %remote_addr,
                user_agent = %user_agent,
                remote_addr_ip = tracing::field::Empty,
                remote_addr_port = tracing::field::Empty,
                call_headers = tracing::field::Empty,
            ),
        };
        if let Some(addr) = call.info.remote_addr {
            span.record("remote_addr_ip", tracing::field::display(addr.ip()));
            span.record("remote_addr_port", u64::from(addr.port()));
        }
        if !self.opts.call_headers.is_empty() {
            let mut headers = serde_json::Map::new();
            for (header_name, field_name) in &self.opts.call_headers {
                if let Some(value) = call.info.header(header_name) {
                    headers.insert(field_name.clone(), serde_json::Value::from(value));
                }
            }
            if !headers.is_empty() {
                let headers = serde_json::Value::Object(headers);
                span.record("call_headers", tracing::field::display(&headers));
            }
        }
        span
    }

    fn log_call_completion(
        &self,
        span: &Span,
        params: &LoggingParams,
        duration: Duration,
        result: &Result<(), Status>,
        code: Code,
    ) {
        if duration >= self.opts.slow_call_threshold {
            let time_slots = serde_json::to_value(params.time_slots()).unwrap_or_default();
            params.extend_fields([
                ("slow_request".to_string(), serde_json::Value::Bool(true)),
                ("time_slots".to_string(), time_slots),
            ]);
        }
        let extra: serde_json::Map<String, serde_json::Value> =
            params.fields().into_iter().collect();
        let extra = serde_json::Value::Object(extra);
        let duration_ms = duration.as_millis() as i64;
        let seconds = duration.as_secs_f64();
        match result {
            Err(status) => tracing::info!(
                parent: span,
                grpc_code = code_label(code),
                duration_ms,
                grpc_error = %status,
                logging_params = %extra,
                "gRPC call finished in {seconds:.3}s"
            ),
            Ok(()) => tracing::info!(
                parent: span,
                grpc_code = code_label(code),
                duration_ms,
                logging_params = %extra,
                "gRPC call finished in {seconds:.3}s"
            ),
        }
    }
}

fn is_logging_disabled(full_method: &str, excluded_methods: &[String]) -> bool {
    excluded_methods.iter().any(|m| m == full_method)
}

/// Extracts the trace ID from a W3C `traceparent` header, if present and
/// well-formed (32 lowercase hex characters).
fn trace_id_from_metadata(metadata: &MetadataMap) -> Option<String> {
    let traceparent = metadata.get("traceparent")?.to_str().ok()?;
    let trace_id = traceparent.split('-').nth(1)?;
    if trace_id.len() == 32 && trace_id.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(trace_id.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{CallKind, Handler, InterceptorChain};
    use crate::testing::capture;
    use tonic::metadata::MetadataValue;

    fn ok_handler() -> Handler {
        Arc::new(|_call| Box::pin(async { Ok(()) }))
    }

    fn failing_handler(status: Status) -> Handler {
        Arc::new(move |_call| {
            let status = status.clone();
            Box::pin(async move { Err(status) })
        })
    }

    fn chain(opts: LoggingOptions) -> InterceptorChain {
        InterceptorChain::new(vec![Arc::new(LoggingInterceptor::new(opts))])
    }

    fn call(full_method: &str) -> Call {
        Call::new(CallInfo::new(full_method, CallKind::Unary))
    }

    #[test]
    fn logging_params_accumulate() {
        let params = LoggingParams::new();
        params.add_time_slot("db", 10);
        params.add_time_slot("db", 15);
        params.add_time_slot("render", 3);
        assert_eq!(params.time_slots().get("db"), Some(&25));
        assert_eq!(params.time_slots().get("render"), Some(&3));

        params.extend_fields([("tenant".to_string(), serde_json::Value::from("t1"))]);
        params.extend_fields([("shard".to_string(), serde_json::Value::from(7))]);
        let fields = params.fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].0, "tenant");
    }

    #[tokio::test]
    async fn logs_finish_event_with_code_and_duration() {
        let (_guard, sink) = capture();
        let chain = chain(LoggingOptions::default());
        let mut call = call("/test.Service/Do");
        chain.execute(&mut call, &ok_handler()).await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].message.starts_with("gRPC call finished in"));
        assert_eq!(events[0].fields.get("grpc_code").map(String::as_str), Some("OK"));
        assert!(events[0].fields.contains_key("duration_ms"));
        assert!(!events[0].fields.contains_key("grpc_error"));
    }

    #[tokio::test]
    async fn call_start_event_is_emitted_when_enabled() {
        let (_guard, sink) = capture();
        let chain = chain(LoggingOptions {
            call_start: true,
            ..Default::default()
        });
        let mut call = call("/test.Service/Do");
        chain.execute(&mut call, &ok_handler()).await.unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "gRPC call started");
    }

    #[tokio::test]
    async fn excluded_method_is_silent_on_success() {
        let (_guard, sink) = capture();
        let chain = chain(LoggingOptions {
            call_start: true,
            excluded_methods: vec!["/test.Service/Do".to_string()],
            ..Default::default()
        });
        let mut call = call("/test.Service/Do");
        chain.execute(&mut call, &ok_handler()).await.unwrap();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn excluded_method_still_logs_on_error() {
        let (_guard, sink) = capture();
        let chain = chain(LoggingOptions {
            call_start: true,
            excluded_methods: vec!["/test.Service/Do".to_string()],
            ..Default::default()
        });
        let mut call = call("/test.Service/Do");
        let result = chain
            .execute(&mut call, &failing_handler(Status::not_found("nope")))
            .await;
        assert!(result.is_err());

        let events = sink.events();
        // The "started" event stays suppressed; only the finish event fires.
        assert_eq!(events.len(), 1);
        assert!(events[0].message.starts_with("gRPC call finished in"));
        assert_eq!(
            events[0].fields.get("grpc_code").map(String::as_str),
            Some("NotFound")
        );
        assert!(events[0].fields.contains_key("grpc_error"));
    }

    #[tokio::test]
    async fn slow_call_is_flagged_with_time_slots() {
        let (_guard, sink) = capture();
        let chain = chain(LoggingOptions {
            slow_call_threshold: Duration::from_millis(10),
            ..Default::default()
        });
        let slow_handler: Handler = Arc::new(|call| {
            let params = call.context.logging_params().cloned();
            Box::pin(async move {
                if let Some(params) = params {
                    params.add_time_slot("db_query", 12);
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
                Ok(())
            })
        });
        let mut call = call("/test.Service/Do");
        chain.execute(&mut call, &slow_handler).await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let logging_params = events[0].fields.get("logging_params").unwrap();
        assert!(logging_params.contains("slow_request"));
        assert!(logging_params.contains("db_query"));
    }

    #[tokio::test]
    async fn fast_call_is_not_flagged_slow() {
        let (_guard, sink) = capture();
        let chain = chain(LoggingOptions::default());
        let mut call = call("/test.Service/Do");
        chain.execute(&mut call, &ok_handler()).await.unwrap();
        let events = sink.events();
        assert!(!events[0]
            .fields
            .get("logging_params")
            .unwrap()
            .contains("slow_request"));
    }

    #[tokio::test]
    async fn custom_logger_provider_becomes_the_call_logger_base() {
        let (_guard, sink) = capture();
        let provider: LoggerProvider =
            Arc::new(|_info, _ctx| Some(tracing::info_span!("tenant_logger")));
        let chain = chain(LoggingOptions {
            custom_logger_provider: Some(provider),
            ..Default::default()
        });
        let mut call = call("/test.Service/Do");
        chain.execute(&mut call, &ok_handler()).await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].message.starts_with("gRPC call finished in"));
        // The finish event is emitted under the provider's span, with the
        // enriched call span layered on top of it.
        assert_eq!(events[0].scope, vec!["tenant_logger", "grpc_call"]);
    }

    #[tokio::test]
    async fn default_logger_base_is_used_without_a_provider() {
        let (_guard, sink) = capture();
        let chain = chain(LoggingOptions::default());
        let mut call = call("/test.Service/Do");
        chain.execute(&mut call, &ok_handler()).await.unwrap();

        let events = sink.events();
        assert_eq!(events[0].scope, vec!["grpc_call"]);
    }

    #[tokio::test]
    async fn custom_logger_provider_backs_the_downstream_logger_too() {
        let (_guard, sink) = capture();
        let provider: LoggerProvider =
            Arc::new(|_info, _ctx| Some(tracing::info_span!("tenant_logger")));
        let chain = chain(LoggingOptions {
            custom_logger_provider: Some(provider),
            excluded_methods: vec!["/test.Service/Do".to_string()],
            ..Default::default()
        });
        let handler: Handler = Arc::new(|call| {
            let logger = call.context.logger().cloned();
            Box::pin(async move {
                if let Some(logger) = logger {
                    tracing::info!(parent: &logger, "handler event");
                }
                Ok(())
            })
        });
        let mut call = call("/test.Service/Do");
        chain.execute(&mut call, &handler).await.unwrap();

        // The method is excluded and succeeds, so the only event is the
        // handler's own, emitted through the context logger.
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "handler event");
        assert_eq!(events[0].scope, vec!["tenant_logger", "grpc_call"]);
    }

    #[tokio::test]
    async fn installs_logger_and_params_into_context() {
        let chain = chain(LoggingOptions::default());
        let seen = Arc::new(Mutex::new(false));
        let handler: Handler = {
            let seen = seen.clone();
            Arc::new(move |call| {
                *seen.lock() =
                    call.context.logger().is_some() && call.context.logging_params().is_some();
                Box::pin(async { Ok(()) })
            })
        };
        let mut call = call("/test.Service/Do");
        chain.execute(&mut call, &handler).await.unwrap();
        assert!(*seen.lock());
    }

    #[test]
    fn trace_id_parsing() {
        let mut md = MetadataMap::new();
        md.insert(
            "traceparent",
            MetadataValue::from_static("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
        );
        assert_eq!(
            trace_id_from_metadata(&md).as_deref(),
            Some("0af7651916cd43dd8448eb211c80319c")
        );

        let mut bad = MetadataMap::new();
        bad.insert("traceparent", MetadataValue::from_static("00-xyz-1-01"));
        assert_eq!(trace_id_from_metadata(&bad), None);
        assert_eq!(trace_id_from_metadata(&MetadataMap::new()), None);
    }
}
