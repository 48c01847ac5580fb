//! Bridge from `tracing` events to exported log records.
//!
//! [`TelemetryLogLayer`] plugs into a `tracing_subscriber` registry next to
//! the usual fmt layer. Every event at or above its minimum level becomes a
//! [`LogRecord`]: the `message` field is the body, other fields become
//! attributes, and `trace_id` / `span_id` fields (integers or hex strings)
//! correlate the record with a span.

use crate::provider::Provider;
use crate::signal::{AttributeValue, LogRecord, Severity, SignalRecord};
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Events from this crate are never bridged; exporting them would feed the
/// pipeline its own diagnostics.
const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

pub struct TelemetryLogLayer {
    provider: Arc<Provider>,
    min_level: Level,
}

impl TelemetryLogLayer {
    /// Bridges INFO and above.
    pub fn new(provider: Arc<Provider>) -> Self {
        Self::with_min_level(provider, Level::INFO)
    }

    pub fn with_min_level(provider: Arc<Provider>, min_level: Level) -> Self {
        Self { provider, min_level }
    }
}

fn severity_of(level: Level) -> Severity {
    match level {
        Level::ERROR => Severity::Error,
        Level::WARN => Severity::Warn,
        Level::INFO => Severity::Info,
        Level::DEBUG => Severity::Debug,
        _ => Severity::Trace,
    }
}

impl<S: Subscriber> Layer<S> for TelemetryLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // tracing orders levels by verbosity: ERROR < WARN < ... < TRACE
        if *meta.level() > self.min_level || meta.target().starts_with(OWN_TARGET) {
            return;
        }

        let mut record = LogRecord::new(severity_of(*meta.level()), String::new());
        record
            .attributes
            .insert("log.target".into(), AttributeValue::from(meta.target()));
        event.record(&mut RecordVisitor { record: &mut record });

        self.provider.try_emit(SignalRecord::Log(record));
    }
}

struct RecordVisitor<'a> {
    record: &'a mut LogRecord,
}

impl RecordVisitor<'_> {
    fn insert(&mut self, field: &Field, value: AttributeValue) {
        self.record.attributes.insert(field.name().to_string(), value);
    }

    fn correlate(&mut self, field: &Field, text: &str) -> bool {
        let text = text.trim_matches('"');
        match field.name() {
            "trace_id" => {
                self.record.trace_id = parse_id(text, u128::from_str_radix);
                true
            }
            "span_id" => {
                self.record.span_id = parse_id(text, u64::from_str_radix);
                true
            }
            _ => false,
        }
    }
}

/// Parses a hex id, with or without `0x`.
fn parse_id<T>(text: &str, from_radix: fn(&str, u32) -> Result<T, std::num::ParseIntError>) -> Option<T> {
    from_radix(text.strip_prefix("0x").unwrap_or(text), 16).ok()
}

impl Visit for RecordVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.record.body = value.to_string();
        } else if !self.correlate(field, value) {
            self.insert(field, AttributeValue::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        match (field.name(), u64::try_from(value)) {
            ("span_id" | "trace_id", Ok(id)) => self.record_u64(field, id),
            _ => self.insert(field, AttributeValue::Int(value)),
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "span_id" => self.record.span_id = Some(value),
            "trace_id" => self.record.trace_id = Some(u128::from(value)),
            _ => self.insert(field, AttributeValue::Int(i64::try_from(value).unwrap_or(i64::MAX))),
        }
    }

    fn record_u128(&mut self, field: &Field, value: u128) {
        if field.name() == "trace_id" {
            self.record.trace_id = Some(value);
        } else {
            self.insert(field, AttributeValue::String(value.to_string()));
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, AttributeValue::Float(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, AttributeValue::Bool(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value);
        if field.name() == "message" {
            self.record.body = text;
        } else if !self.correlate(field, &text) {
            self.insert(field, AttributeValue::String(text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::exporter::TestExporter;
    use crate::provider::TelemetryProvider;
    use crate::signal::SignalKind;
    use std::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;

    fn bridged_logs(emit: impl FnOnce()) -> (TelemetryProvider, Arc<TestExporter>) {
        let logs = Arc::new(TestExporter::new());
        let config = PipelineConfig {
            export_interval: Duration::from_secs(3600),
            ..PipelineConfig::default()
        };
        let telemetry = TelemetryProvider::with_exporters(
            &config,
            Arc::new(TestExporter::new()),
            Arc::new(TestExporter::new()),
            logs.clone(),
        );

        let layer = TelemetryLogLayer::new(Arc::clone(telemetry.provider(SignalKind::Log)));
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, emit);
        (telemetry, logs)
    }

    fn records(exporter: &TestExporter) -> Vec<LogRecord> {
        exporter
            .all_records()
            .into_iter()
            .filter_map(|r| match r {
                SignalRecord::Log(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_events_become_log_records() {
        let (telemetry, logs) = bridged_logs(|| {
            tracing::info!(target: "demo_app", user_id = 42_i64, cached = true, "Fetching user 42");
            tracing::error!(target: "demo_app", "User 999 not found");
        });
        telemetry.force_flush(Duration::from_secs(5)).await.unwrap();

        let records = records(&logs);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].severity, Severity::Info);
        assert_eq!(records[0].body, "Fetching user 42");
        assert_eq!(records[0].attributes["user_id"], AttributeValue::Int(42));
        assert_eq!(records[0].attributes["cached"], AttributeValue::Bool(true));
        assert_eq!(records[0].attributes["log.target"], AttributeValue::from("demo_app"));
        assert_eq!(records[1].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_filters_level_and_own_target() {
        let (telemetry, logs) = bridged_logs(|| {
            tracing::debug!(target: "demo_app", "Health check called");
            tracing::warn!(target: "telemetry_pipeline::batch_processor", "internal");
            tracing::warn!(target: "demo_app", "kept");
        });
        telemetry.force_flush(Duration::from_secs(5)).await.unwrap();

        let records = records(&logs);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, "kept");
    }

    #[tokio::test]
    async fn test_trace_correlation_fields() {
        let (telemetry, logs) = bridged_logs(|| {
            tracing::info!(
                target: "demo_app",
                trace_id = %format!("{:032x}", 0xabc_u128),
                span_id = 7_u64,
                "correlated"
            );
        });
        telemetry.force_flush(Duration::from_secs(5)).await.unwrap();

        let records = records(&logs);
        assert_eq!(records[0].trace_id, Some(0xabc));
        assert_eq!(records[0].span_id, Some(7));
        assert!(!records[0].attributes.contains_key("trace_id"));
    }

    #[tokio::test]
    async fn test_untyped_integer_ids_correlate() {
        let (telemetry, logs) = bridged_logs(|| {
            tracing::info!(target: "demo_app", span_id = 7, trace_id = 3, "plain literals");
            tracing::info!(target: "demo_app", span_id = -1, "negative");
        });
        telemetry.force_flush(Duration::from_secs(5)).await.unwrap();

        let records = records(&logs);
        assert_eq!(records[0].span_id, Some(7));
        assert_eq!(records[0].trace_id, Some(3));
        assert!(!records[0].attributes.contains_key("span_id"));
        assert!(!records[0].attributes.contains_key("trace_id"));

        // Not a valid id, kept as an attribute
        assert_eq!(records[1].span_id, None);
        assert_eq!(records[1].attributes["span_id"], AttributeValue::Int(-1));
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("ff", u64::from_str_radix), Some(255));
        assert_eq!(parse_id("0x10", u64::from_str_radix), Some(16));
        assert_eq!(parse_id("zz", u64::from_str_radix), None);
    }
}
