//! Test support: an in-memory `tracing` event sink.
//!
//! Interceptor behaviour is largely observable through the events it emits,
//! so both unit and integration tests install a capture layer as the
//! thread-default subscriber and assert on the collected events.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::Registry;

/// One captured `tracing` event.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, String>,
    /// Names of the spans the event was emitted under, root first.
    pub scope: Vec<String>,
}

/// Shared handle to the events captured so far.
#[derive(Clone, Default)]
pub struct EventSink {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl EventSink {
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.message.clone()).collect()
    }
}

struct CaptureLayer {
    sink: EventSink,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let scope = ctx
            .event_scope(event)
            .map(|scope| {
                scope
                    .from_root()
                    .map(|span| span.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        self.sink.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
            scope,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

/// Installs a capture subscriber as the thread default and returns the guard
/// together with the sink. Keep the guard alive for the duration of the test;
/// use single-threaded runtimes so spawned work stays on the same thread.
pub fn capture() -> (DefaultGuard, EventSink) {
    let sink = EventSink::default();
    let subscriber = Registry::default().with(CaptureLayer { sink: sink.clone() });
    let guard = tracing::subscriber::set_default(subscriber);
    (guard, sink)
}
