//! End-to-end scenarios over the canonical interceptor chain as assembled by
//! the server shell.

use std::sync::Arc;

use tollgate_server::config::GrpcServerConfig;
use tollgate_server::interceptor::{Call, CallInfo, CallKind, Handler};
use tollgate_server::server::{GrpcServer, ServerOptions};
use tollgate_server::testing::capture;
use tonic::metadata::MetadataValue;
use tonic::Code;

fn server(config_yaml: &str) -> GrpcServer {
    let config: GrpcServerConfig = serde_yaml::from_str(config_yaml).unwrap();
    GrpcServer::new(config, ServerOptions::default()).unwrap()
}

fn ok_handler() -> Handler {
    Arc::new(|_call| Box::pin(async { Ok(()) }))
}

#[tokio::test]
async fn minted_request_ids_reach_response_metadata_and_context() {
    let server = server("address: \"127.0.0.1:0\"");
    let chain = server.interceptor_chain();

    let mut call = Call::new(CallInfo::new("/acme.Files/Upload", CallKind::Unary));
    chain.execute(&mut call, &ok_handler()).await.unwrap();

    let request_id = call
        .response_metadata()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(request_id.len(), 20);
    assert_eq!(call.context.request_id(), Some(request_id.as_str()));

    let int_request_id = call
        .response_metadata()
        .get("x-int-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(int_request_id, request_id);
    assert_eq!(call.context.int_request_id(), Some(int_request_id.as_str()));
}

#[tokio::test]
async fn supplied_request_id_is_adopted_and_internal_one_minted() {
    let server = server("address: \"127.0.0.1:0\"");
    let chain = server.interceptor_chain();

    let mut info = CallInfo::new("/acme.Files/Upload", CallKind::Unary);
    info.metadata
        .insert("x-request-id", MetadataValue::from_static("caller-chosen"));
    let mut call = Call::new(info);
    chain.execute(&mut call, &ok_handler()).await.unwrap();

    assert_eq!(
        call.response_metadata().get("x-request-id").unwrap(),
        "caller-chosen"
    );
    assert_eq!(call.context.request_id(), Some("caller-chosen"));
    assert_eq!(call.context.int_request_id().unwrap().len(), 20);
}

#[tokio::test]
async fn panic_on_excluded_method_logs_exactly_twice_and_returns_internal() {
    let (_guard, sink) = capture();
    let server = server(
        r#"
address: "127.0.0.1:0"
log:
  callStart: true
  excludedMethods: ["/acme.Files/Upload"]
"#,
    );
    let chain = server.interceptor_chain();

    let panicking: Handler = Arc::new(|_call| Box::pin(async { panic!("handler exploded") }));
    let mut call = Call::new(CallInfo::new("/acme.Files/Upload", CallKind::Unary));
    let status = chain.execute(&mut call, &panicking).await.unwrap_err();
    assert_eq!(status.code(), Code::Internal);

    // The "started" event is suppressed for the excluded method; the panic
    // log and the finish log are the only two entries.
    let events = sink.events();
    assert_eq!(events.len(), 2, "events: {events:?}");
    assert!(events[0].message.contains("Panic: handler exploded"));
    assert_eq!(events[0].level, tracing::Level::ERROR);
    assert!(events[1].message.starts_with("gRPC call finished in"));
    assert_eq!(
        events[1].fields.get("grpc_code").map(String::as_str),
        Some("Internal")
    );
}

#[tokio::test]
async fn successful_call_on_excluded_method_stays_silent() {
    let (_guard, sink) = capture();
    let server = server(
        r#"
address: "127.0.0.1:0"
log:
  callStart: true
  excludedMethods: ["/acme.Files/Upload"]
"#,
    );
    let chain = server.interceptor_chain();
    let mut call = Call::new(CallInfo::new("/acme.Files/Upload", CallKind::Unary));
    chain.execute(&mut call, &ok_handler()).await.unwrap();
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn call_metrics_observe_through_the_assembled_chain() {
    let server = server("address: \"127.0.0.1:0\"");
    let chain = server.interceptor_chain();

    let mut call = Call::new(CallInfo::new("/acme.Files/Upload", CallKind::Unary));
    chain.execute(&mut call, &ok_handler()).await.unwrap();

    let failing: Handler =
        Arc::new(|_call| Box::pin(async { Err(tonic::Status::not_found("missing")) }));
    let mut call = Call::new(CallInfo::new("/acme.Files/Upload", CallKind::Unary));
    let _ = chain.execute(&mut call, &failing).await;

    let metrics = server.call_metrics();
    assert_eq!(metrics.duration_count("acme.Files", "Upload", "unary", "OK"), 1);
    assert_eq!(
        metrics.duration_count("acme.Files", "Upload", "unary", "NotFound"),
        1
    );
    assert_eq!(metrics.in_flight_value("acme.Files", "Upload", "unary"), 0);
}

#[tokio::test]
async fn user_interceptors_run_after_the_canonical_chain() {
    struct ContextProbe(Arc<parking_lot::Mutex<bool>>);

    #[async_trait::async_trait]
    impl tollgate_server::interceptor::Interceptor for ContextProbe {
        async fn intercept<'a>(
            &'a self,
            call: &'a mut Call,
            next: tollgate_server::interceptor::Next<'a>,
        ) -> Result<(), tonic::Status> {
            // Everything the canonical interceptors install must be visible.
            *self.0.lock() = call.context.request_id().is_some()
                && call.context.int_request_id().is_some()
                && call.context.call_start_time().is_some()
                && call.context.logger().is_some()
                && call.context.logging_params().is_some();
            next.run(call).await
        }
    }

    let seen = Arc::new(parking_lot::Mutex::new(false));
    let config: GrpcServerConfig = serde_yaml::from_str("address: \"127.0.0.1:0\"").unwrap();
    let server = GrpcServer::new(
        config,
        ServerOptions {
            interceptors: vec![Arc::new(ContextProbe(seen.clone()))],
            ..Default::default()
        },
    )
    .unwrap();

    let mut call = Call::new(CallInfo::new("/acme.Files/Upload", CallKind::Unary));
    server
        .interceptor_chain()
        .execute(&mut call, &ok_handler())
        .await
        .unwrap();
    assert!(*seen.lock());
}
