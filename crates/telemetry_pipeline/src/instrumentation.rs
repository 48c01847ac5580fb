//! Explicit instrumentation hooks.
//!
//! Application code records telemetry through handles obtained from a
//! [`TelemetryProvider`]: a [`Tracer`] for spans, a [`Meter`] for metric
//! instruments and a [`Logger`] for log records. Request handling and
//! outbound calls are instrumented by calling a [`RequestInterceptor`] /
//! [`OutboundCallInterceptor`] at their boundaries; [`HttpInstrumentation`]
//! implements both.
//!
//! Every hook emits with `try_emit`, so instrumentation never waits on the
//! pipeline whatever the overflow policy.

use crate::provider::{EmitOutcome, Provider, TelemetryProvider};
use crate::signal::{
    now_unix_nanos, AttributeValue, Attributes, HistogramBuckets, InstrumentKind, LogRecord,
    MetricPoint, MetricValue, Severity, SignalRecord, Span, SpanKind, SpanStatus,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Default explicit bucket bounds for histograms.
pub const DEFAULT_HISTOGRAM_BOUNDS: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

/// Bucket bounds for durations measured in seconds.
pub const DURATION_SECONDS_BOUNDS: [f64; 11] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

fn to_attributes(attributes: &[(&str, AttributeValue)]) -> Attributes {
    attributes
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

// =============================================================================
// TRACING
// =============================================================================

/// Identifies a span for parenting and log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
}

#[derive(Clone)]
pub struct Tracer {
    provider: Arc<Provider>,
}

impl Tracer {
    pub(crate) fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    /// Starts a span. Without a parent it begins a new trace.
    pub fn start_span(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&SpanContext>,
    ) -> ActiveSpan {
        let mut rng = rand::thread_rng();
        let trace_id = parent.map_or_else(|| rng.gen_range(1..=u128::MAX), |p| p.trace_id);
        let span_id = rng.gen_range(1..=u64::MAX);

        ActiveSpan {
            provider: Arc::clone(&self.provider),
            context: SpanContext { trace_id, span_id },
            span: Some(Span {
                trace_id,
                span_id,
                parent_span_id: parent.map(|p| p.span_id),
                name: name.into(),
                kind,
                start_time_unix_nano: now_unix_nanos(),
                end_time_unix_nano: 0,
                attributes: Attributes::new(),
                status: SpanStatus::Unset,
            }),
        }
    }
}

/// A span being recorded. Emitted when [`end`](Self::end) is called or
/// when dropped.
pub struct ActiveSpan {
    provider: Arc<Provider>,
    context: SpanContext,
    span: Option<Span>,
}

impl ActiveSpan {
    pub fn context(&self) -> SpanContext {
        self.context
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if let Some(span) = self.span.as_mut() {
            span.attributes.insert(key.into(), value.into());
        }
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(span) = self.span.as_mut() {
            span.status = status;
        }
    }

    /// Marks the span failed and records the error message.
    pub fn record_error(&mut self, description: impl Into<String>) {
        let description = description.into();
        self.set_attribute("exception.message", description.clone());
        self.set_status(SpanStatus::Error {
            description: Some(description),
        });
    }

    /// Finishes the span and hands it to the pipeline.
    pub fn end(mut self) -> EmitOutcome {
        self.finish().unwrap_or(EmitOutcome::Closed)
    }

    fn finish(&mut self) -> Option<EmitOutcome> {
        let mut span = self.span.take()?;
        span.end_time_unix_nano = now_unix_nanos().max(span.start_time_unix_nano);
        Some(self.provider.try_emit(SignalRecord::Span(span)))
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.finish();
    }
}

// =============================================================================
// METRICS
// =============================================================================

#[derive(Clone)]
pub struct Meter {
    provider: Arc<Provider>,
}

impl Meter {
    pub(crate) fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    fn instrument(&self, name: &str, description: &str, unit: &str, kind: InstrumentKind) -> Arc<Instrument> {
        Arc::new(Instrument {
            provider: Arc::clone(&self.provider),
            name: name.to_string(),
            description: description.to_string(),
            unit: unit.to_string(),
            kind,
        })
    }

    pub fn counter(&self, name: &str, description: &str, unit: &str) -> Counter {
        Counter(self.instrument(name, description, unit, InstrumentKind::Counter))
    }

    pub fn up_down_counter(&self, name: &str, description: &str, unit: &str) -> UpDownCounter {
        UpDownCounter(self.instrument(name, description, unit, InstrumentKind::UpDownCounter))
    }

    /// Histogram with [`DEFAULT_HISTOGRAM_BOUNDS`].
    pub fn histogram(&self, name: &str, description: &str, unit: &str) -> Histogram {
        self.histogram_with_bounds(name, description, unit, &DEFAULT_HISTOGRAM_BOUNDS)
    }

    pub fn histogram_with_bounds(&self, name: &str, description: &str, unit: &str, bounds: &[f64]) -> Histogram {
        Histogram {
            instrument: self.instrument(name, description, unit, InstrumentKind::Histogram),
            bounds: bounds.into(),
        }
    }
}

struct Instrument {
    provider: Arc<Provider>,
    name: String,
    description: String,
    unit: String,
    kind: InstrumentKind,
}

impl Instrument {
    fn emit(&self, value: MetricValue, attributes: &[(&str, AttributeValue)]) -> EmitOutcome {
        self.provider.try_emit(SignalRecord::Metric(MetricPoint {
            name: self.name.clone(),
            description: self.description.clone(),
            unit: self.unit.clone(),
            kind: self.kind,
            value,
            attributes: to_attributes(attributes),
            time_unix_nano: now_unix_nanos(),
        }))
    }
}

/// Monotonic sum; only non-negative increments.
#[derive(Clone)]
pub struct Counter(Arc<Instrument>);

impl Counter {
    pub fn add(&self, value: u64, attributes: &[(&str, AttributeValue)]) -> EmitOutcome {
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        self.0.emit(MetricValue::Int(value), attributes)
    }
}

#[derive(Clone)]
pub struct UpDownCounter(Arc<Instrument>);

impl UpDownCounter {
    pub fn add(&self, value: i64, attributes: &[(&str, AttributeValue)]) -> EmitOutcome {
        self.0.emit(MetricValue::Int(value), attributes)
    }
}

#[derive(Clone)]
pub struct Histogram {
    instrument: Arc<Instrument>,
    bounds: Arc<[f64]>,
}

impl Histogram {
    /// Records one measurement. Non-finite values are discarded.
    pub fn record(&self, value: f64, attributes: &[(&str, AttributeValue)]) -> EmitOutcome {
        if !value.is_finite() {
            debug!(instrument = %self.instrument.name, value, "discarding non-finite measurement");
            return EmitOutcome::Dropped;
        }
        self.instrument.emit(
            MetricValue::Histogram(HistogramBuckets::single(&self.bounds, value)),
            attributes,
        )
    }
}

// =============================================================================
// LOGS
// =============================================================================

#[derive(Clone)]
pub struct Logger {
    provider: Arc<Provider>,
}

impl Logger {
    pub(crate) fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    /// Emits a log record, correlated with `context` when given.
    pub fn emit(
        &self,
        severity: Severity,
        body: impl Into<String>,
        attributes: &[(&str, AttributeValue)],
        context: Option<&SpanContext>,
    ) -> EmitOutcome {
        let mut record = LogRecord::new(severity, body);
        record.attributes = to_attributes(attributes);
        if let Some(ctx) = context {
            record = record.with_trace_context(ctx.trace_id, ctx.span_id);
        }
        self.provider.try_emit(SignalRecord::Log(record))
    }

    pub fn info(&self, body: impl Into<String>, context: Option<&SpanContext>) -> EmitOutcome {
        self.emit(Severity::Info, body, &[], context)
    }

    pub fn error(&self, body: impl Into<String>, context: Option<&SpanContext>) -> EmitOutcome {
        self.emit(Severity::Error, body, &[], context)
    }
}

// =============================================================================
// INTERCEPTORS
// =============================================================================

/// State carried from the start to the end of one handled request.
pub struct RequestScope {
    span: ActiveSpan,
    method: String,
    route: String,
    started: Instant,
}

impl RequestScope {
    /// Context for child spans and correlated logs
    pub fn context(&self) -> SpanContext {
        self.span.context()
    }

    pub fn span_mut(&mut self) -> &mut ActiveSpan {
        &mut self.span
    }

    pub fn route(&self) -> &str {
        &self.route
    }
}

/// State carried from the start to the end of one outbound call.
pub struct CallScope {
    span: ActiveSpan,
    started: Instant,
}

impl CallScope {
    pub fn context(&self) -> SpanContext {
        self.span.context()
    }
}

/// Called around every handled request.
pub trait RequestInterceptor: Send + Sync {
    fn on_request_start(&self, method: &str, route: &str) -> RequestScope;
    fn on_request_end(&self, scope: RequestScope, status_code: u16);
}

/// Called around every outbound call. `Err` carries the failure message
/// when no response was received.
pub trait OutboundCallInterceptor: Send + Sync {
    fn on_call_start(&self, parent: Option<&SpanContext>, method: &str, url: &str) -> CallScope;
    fn on_call_end(&self, scope: CallScope, outcome: Result<u16, &str>);
}

/// Server and client spans plus the HTTP request instruments
/// (`http_requests_total`, `http_request_duration_seconds`,
/// `http_requests_active`).
#[derive(Clone)]
pub struct HttpInstrumentation {
    tracer: Tracer,
    requests_total: Counter,
    request_duration: Histogram,
    requests_active: UpDownCounter,
}

impl HttpInstrumentation {
    pub fn new(telemetry: &TelemetryProvider) -> Self {
        let meter = telemetry.meter();
        Self {
            tracer: telemetry.tracer(),
            requests_total: meter.counter("http_requests_total", "Total number of HTTP requests", "1"),
            request_duration: meter.histogram_with_bounds(
                "http_request_duration_seconds",
                "HTTP request duration",
                "s",
                &DURATION_SECONDS_BOUNDS,
            ),
            requests_active: meter.up_down_counter(
                "http_requests_active",
                "Number of active HTTP requests",
                "1",
            ),
        }
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }
}

impl RequestInterceptor for HttpInstrumentation {
    fn on_request_start(&self, method: &str, route: &str) -> RequestScope {
        let mut span = self
            .tracer
            .start_span(format!("{} {}", method, route), SpanKind::Server, None);
        span.set_attribute("http.method", method);
        span.set_attribute("http.route", route);

        self.requests_active.add(1, &[("endpoint", route.into())]);

        RequestScope {
            span,
            method: method.to_string(),
            route: route.to_string(),
            started: Instant::now(),
        }
    }

    fn on_request_end(&self, scope: RequestScope, status_code: u16) {
        let RequestScope {
            mut span,
            method,
            route,
            started,
        } = scope;
        let elapsed = started.elapsed().as_secs_f64();

        span.set_attribute("http.status_code", i64::from(status_code));
        if status_code >= 500 {
            span.set_status(SpanStatus::Error {
                description: Some(format!("HTTP {}", status_code)),
            });
        }
        span.end();

        self.requests_total.add(
            1,
            &[
                ("endpoint", route.as_str().into()),
                ("method", method.as_str().into()),
                ("status_code", i64::from(status_code).into()),
            ],
        );
        self.request_duration
            .record(elapsed, &[("endpoint", route.as_str().into())]);
        self.requests_active.add(-1, &[("endpoint", route.as_str().into())]);
    }
}

impl OutboundCallInterceptor for HttpInstrumentation {
    fn on_call_start(&self, parent: Option<&SpanContext>, method: &str, url: &str) -> CallScope {
        let mut span = self
            .tracer
            .start_span(format!("{} {}", method, url), SpanKind::Client, parent);
        span.set_attribute("http.method", method);
        span.set_attribute("http.url", url);
        CallScope {
            span,
            started: Instant::now(),
        }
    }

    fn on_call_end(&self, scope: CallScope, outcome: Result<u16, &str>) {
        let CallScope { mut span, started } = scope;
        span.set_attribute("http.duration_seconds", started.elapsed().as_secs_f64());
        match outcome {
            Ok(status_code) => {
                span.set_attribute("http.status_code", i64::from(status_code));
                if status_code >= 400 {
                    span.set_status(SpanStatus::Error {
                        description: Some(format!("HTTP {}", status_code)),
                    });
                }
            }
            Err(message) => span.record_error(message),
        }
        span.end();
    }
}
