//! Panic recovery.
//!
//! Traps panics raised anywhere below this interceptor, logs them through the
//! per-call logger with a capped backtrace, and converts them into an
//! "internal" RPC failure so the connection survives.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tonic::Status;

use super::{Call, Interceptor, Next};

const DEFAULT_STACK_SIZE: usize = 8192;

pub struct RecoveryInterceptor {
    stack_size: usize,
}

impl RecoveryInterceptor {
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Caps the logged backtrace at `stack_size` bytes; zero disables capture.
    pub fn with_stack_size(stack_size: usize) -> Self {
        Self { stack_size }
    }
}

impl Default for RecoveryInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Interceptor for RecoveryInterceptor {
    async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status> {
        let outcome = AssertUnwindSafe(next.run(call)).catch_unwind().await;
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload);
                if let Some(logger) = call.context.logger() {
                    let stack = if self.stack_size > 0 {
                        let mut stack = std::backtrace::Backtrace::force_capture().to_string();
                        if stack.len() > self.stack_size {
                            // Cut on a char boundary; truncating mid-character
                            // would panic inside the recovery path itself.
                            let mut cut = self.stack_size;
                            while !stack.is_char_boundary(cut) {
                                cut -= 1;
                            }
                            stack.truncate(cut);
                        }
                        stack
                    } else {
                        String::new()
                    };
                    tracing::error!(parent: logger, stack = %stack, "Panic: {message}");
                }
                Err(Status::internal("Internal error"))
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{CallInfo, CallKind, Handler, InterceptorChain};
    use crate::testing::capture;
    use std::sync::Arc;
    use tonic::Code;

    fn panicking_handler() -> Handler {
        Arc::new(|_call| Box::pin(async { panic!("handler blew up") }))
    }

    #[tokio::test]
    async fn converts_panic_to_internal_error() {
        let chain = InterceptorChain::new(vec![Arc::new(RecoveryInterceptor::new())]);
        let mut call = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        let status = chain
            .execute(&mut call, &panicking_handler())
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "Internal error");
    }

    #[tokio::test]
    async fn logs_panic_with_stack_when_logger_present() {
        let (_guard, sink) = capture();
        let chain = InterceptorChain::new(vec![Arc::new(RecoveryInterceptor::new())]);
        let mut call = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        call.context.set_logger(tracing::info_span!("test_call"));

        let _ = chain.execute(&mut call, &panicking_handler()).await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, tracing::Level::ERROR);
        assert!(events[0].message.contains("Panic: handler blew up"));
        assert!(events[0].fields.contains_key("stack"));
    }

    #[tokio::test]
    async fn no_log_without_logger_in_context() {
        let (_guard, sink) = capture();
        let chain = InterceptorChain::new(vec![Arc::new(RecoveryInterceptor::new())]);
        let mut call = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        let _ = chain.execute(&mut call, &panicking_handler()).await;
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn zero_stack_size_disables_capture() {
        let (_guard, sink) = capture();
        let chain = InterceptorChain::new(vec![Arc::new(RecoveryInterceptor::with_stack_size(0))]);
        let mut call = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        call.context.set_logger(tracing::info_span!("test_call"));
        let _ = chain.execute(&mut call, &panicking_handler()).await;

        let events = sink.events();
        assert_eq!(events[0].fields.get("stack").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn stack_capture_is_capped_at_stack_size() {
        let (_guard, sink) = capture();
        let chain = InterceptorChain::new(vec![Arc::new(RecoveryInterceptor::with_stack_size(64))]);
        let mut call = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        call.context.set_logger(tracing::info_span!("test_call"));
        let _ = chain.execute(&mut call, &panicking_handler()).await;

        let events = sink.events();
        assert!(events[0].fields.get("stack").unwrap().len() <= 64);
    }

    #[tokio::test]
    async fn passes_through_normal_results() {
        let chain = InterceptorChain::new(vec![Arc::new(RecoveryInterceptor::new())]);
        let mut call = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        let handler: Handler =
            Arc::new(|_call| Box::pin(async { Err(Status::not_found("missing")) }));
        let status = chain.execute(&mut call, &handler).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }
}
