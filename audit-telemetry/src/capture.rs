use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tracing::{Id, Subscriber};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

/// A span that has closed, with the fields recorded on it.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedSpan {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Nanoseconds since the Unix epoch.
    pub start_time: u128,
    pub end_time: u128,
    pub fields: HashMap<String, serde_json::Value>,
}

impl CapturedSpan {
    /// The field `key` as a string, if it was recorded as one.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }
}

/// Closed spans collected by a [`SpanCaptureLayer`].
#[derive(Debug, Clone, Default)]
pub struct SpanCapture {
    spans: Arc<RwLock<Vec<CapturedSpan>>>,
}

impl SpanCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A layer that feeds this capture.
    pub fn layer(&self) -> SpanCaptureLayer {
        SpanCaptureLayer { capture: self.clone() }
    }

    /// Every captured span named `name`, in closing order.
    pub fn spans_named(&self, name: &str) -> Vec<CapturedSpan> {
        let spans = self.spans.read().unwrap_or_else(PoisonError::into_inner);
        spans.iter().filter(|s| s.name == name).cloned().collect()
    }

    /// Captured spans whose `run_id` field equals `run_id`.
    pub fn for_run(&self, run_id: &str) -> Vec<CapturedSpan> {
        self.spans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.field_str("run_id") == Some(run_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.spans.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, span: CapturedSpan) {
        self.spans.write().unwrap_or_else(PoisonError::into_inner).push(span);
    }
}

/// A tracing layer that records closed spans in memory.
///
/// `run_id` and `document` recorded on a parent span are copied onto its
/// children, so every span of a workflow run can be found by run id.
pub struct SpanCaptureLayer {
    capture: SpanCapture,
}

#[derive(Clone)]
struct SpanFields(HashMap<String, serde_json::Value>);

#[derive(Clone, Copy)]
struct StartTime(u128);

const INHERITED: [&str; 2] = ["run_id", "document"];

fn now_nanos() -> u128 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_nanos()
}

impl<S> Layer<S> for SpanCaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };

        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        let mut fields = visitor.0;

        if let Some(parent) = span.parent() {
            if let Some(parent_fields) = parent.extensions().get::<SpanFields>() {
                for key in INHERITED {
                    if !fields.contains_key(key) {
                        if let Some(value) = parent_fields.0.get(key) {
                            fields.insert(key.to_string(), value.clone());
                        }
                    }
                }
            }
        }

        let mut extensions = span.extensions_mut();
        extensions.insert(StartTime(now_nanos()));
        extensions.insert(SpanFields(fields));
    }

    fn on_record(&self, id: &Id, values: &tracing::span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        if let Some(fields) = extensions.get_mut::<SpanFields>() {
            let mut visitor = JsonVisitor::default();
            values.record(&mut visitor);
            fields.0.extend(visitor.0);
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else { return };
        let extensions = span.extensions();
        self.capture.push(CapturedSpan {
            name: span.metadata().name().to_string(),
            parent: span.parent().map(|p| p.metadata().name().to_string()),
            start_time: extensions.get::<StartTime>().map(|s| s.0).unwrap_or(0),
            end_time: now_nanos(),
            fields: extensions.get::<SpanFields>().map(|f| f.0.clone()).unwrap_or_default(),
        });
    }
}

#[derive(Default)]
struct JsonVisitor(HashMap<String, serde_json::Value>);

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), serde_json::Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info_span;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn children_inherit_run_fields() {
        let capture = SpanCapture::new();
        let subscriber = tracing_subscriber::registry().with(capture.layer());

        tracing::subscriber::with_default(subscriber, || {
            let run = info_span!("audit_run", run_id = "run-7", document = "acme.txt");
            let _run = run.enter();
            let stage = info_span!("extraction", criterion = "Emissions");
            let _stage = stage.enter();
        });

        let spans = capture.for_run("run-7");
        assert_eq!(spans.len(), 2);
        let stage = &capture.spans_named("extraction")[0];
        assert_eq!(stage.parent.as_deref(), Some("audit_run"));
        assert_eq!(stage.field_str("document"), Some("acme.txt"));
        assert_eq!(stage.field_str("criterion"), Some("Emissions"));
        assert!(stage.end_time >= stage.start_time);
    }

    #[test]
    fn serializes_without_empty_parent() {
        let span = CapturedSpan {
            name: "audit_run".to_string(),
            parent: None,
            start_time: 1,
            end_time: 2,
            fields: HashMap::new(),
        };
        let json = serde_json::to_string(&span).unwrap();
        assert!(json.contains("\"name\":\"audit_run\""));
        assert!(!json.contains("parent"));
    }
}
