//! Signal records: the immutable units of telemetry that flow through the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Attribute mapping shared by every signal kind.
pub type Attributes = HashMap<String, AttributeValue>;

/// Current wall-clock time as Unix nanoseconds.
pub fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Scalar attribute value.
///
/// Externally tagged so that the binary wire codec can decode it without
/// self-describing input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u16> for AttributeValue {
    fn from(value: u16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// The three telemetry kinds. Each kind gets its own buffer, processor and exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Span,
    Metric,
    Log,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Span, SignalKind::Metric, SignalKind::Log];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Span => "span",
            Self::Metric => "metric",
            Self::Log => "log",
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Span => 1,
            Self::Metric => 2,
            Self::Log => 3,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Span),
            2 => Some(Self::Metric),
            3 => Some(Self::Log),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SPANS
// =============================================================================

/// Span kind according to the OpenTelemetry data model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

/// Span completion status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Status not set by the instrumentation
    Unset,
    /// Completed successfully
    Ok,
    /// Completed with an error, optionally described
    Error { description: Option<String> },
}

impl SpanStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// A finished, timed unit of work within a distributed trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Trace identifier (128-bit)
    pub trace_id: u128,
    /// Span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier, `None` for root spans
    pub parent_span_id: Option<u64>,
    /// Operation name
    pub name: String,
    pub kind: SpanKind,
    /// Start time (Unix nanoseconds)
    pub start_time_unix_nano: u64,
    /// End time (Unix nanoseconds)
    pub end_time_unix_nano: u64,
    pub attributes: Attributes,
    pub status: SpanStatus,
}

impl Span {
    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time_unix_nano.saturating_sub(self.start_time_unix_nano)
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Instrument kind that produced a metric point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentKind {
    Counter,
    UpDownCounter,
    Histogram,
}

/// Explicit-bucket histogram.
///
/// `bucket_counts` always has `bounds.len() + 1` entries; the last bucket
/// collects everything above the highest bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBuckets {
    pub bounds: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl HistogramBuckets {
    /// Creates an empty histogram over the given upper bounds (sorted ascending).
    pub fn new(mut bounds: Vec<f64>) -> Self {
        bounds.retain(|b| b.is_finite());
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        let bucket_counts = vec![0; bounds.len() + 1];
        Self {
            bounds,
            bucket_counts,
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
        }
    }

    /// Histogram holding a single observation.
    pub fn single(bounds: &[f64], value: f64) -> Self {
        let mut histogram = Self::new(bounds.to_vec());
        histogram.observe(value);
        histogram
    }

    pub fn observe(&mut self, value: f64) {
        let index = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.bucket_counts[index] += 1;
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }
}

/// Value carried by a metric point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Histogram(HistogramBuckets),
}

/// One recorded measurement from an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Instrument name, e.g. `http_requests_total`
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: InstrumentKind,
    pub value: MetricValue,
    pub attributes: Attributes,
    pub time_unix_nano: u64,
}

// =============================================================================
// LOGS
// =============================================================================

/// Log severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// A log line, optionally correlated with the span that was active when it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub severity: Severity,
    pub body: String,
    pub time_unix_nano: u64,
    pub attributes: Attributes,
    pub trace_id: Option<u128>,
    pub span_id: Option<u64>,
}

impl LogRecord {
    pub fn new(severity: Severity, body: impl Into<String>) -> Self {
        Self {
            severity,
            body: body.into(),
            time_unix_nano: now_unix_nanos(),
            attributes: Attributes::new(),
            trace_id: None,
            span_id: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_trace_context(mut self, trace_id: u128, span_id: u64) -> Self {
        self.trace_id = Some(trace_id);
        self.span_id = Some(span_id);
        self
    }
}

// =============================================================================
// SIGNAL RECORD / BATCH / RESOURCE
// =============================================================================

/// Tagged union over the three telemetry kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalRecord {
    Span(Span),
    Metric(MetricPoint),
    Log(LogRecord),
}

impl SignalRecord {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Span(_) => SignalKind::Span,
            Self::Metric(_) => SignalKind::Metric,
            Self::Log(_) => SignalKind::Log,
        }
    }
}

impl From<Span> for SignalRecord {
    fn from(span: Span) -> Self {
        Self::Span(span)
    }
}

impl From<MetricPoint> for SignalRecord {
    fn from(point: MetricPoint) -> Self {
        Self::Metric(point)
    }
}

impl From<LogRecord> for SignalRecord {
    fn from(record: LogRecord) -> Self {
        Self::Log(record)
    }
}

/// Records of one kind taken from a buffer in a single drain.
///
/// The records sit behind an `Arc<[_]>`: a batch is never modified after it is
/// formed, and retries hand the same allocation to each attempt.
#[derive(Debug, Clone)]
pub struct Batch {
    kind: SignalKind,
    records: Arc<[SignalRecord]>,
    created_at: SystemTime,
}

impl Batch {
    /// Creates a batch. Records of another kind are a caller bug.
    pub fn new(kind: SignalKind, records: Vec<SignalRecord>) -> Self {
        debug_assert!(
            records.iter().all(|r| r.kind() == kind),
            "batch of kind {} contains records of another kind",
            kind
        );
        Self {
            kind,
            records: records.into(),
            created_at: SystemTime::now(),
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn records(&self) -> &[SignalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

/// Identity of the emitting service, sent once per exported batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub service_name: String,
    pub service_version: String,
    pub deployment_environment: String,
    pub attributes: Attributes,
}

impl Resource {
    pub fn new(
        service_name: impl Into<String>,
        service_version: impl Into<String>,
        deployment_environment: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            deployment_environment: deployment_environment.into(),
            attributes: Attributes::new(),
        }
    }
}

impl Default for Resource {
    fn default() -> Self {
        Self::new("telemetry-demo", env!("CARGO_PKG_VERSION"), "development")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_bucketing() {
        let mut h = HistogramBuckets::new(vec![1.0, 0.1, 0.5]);
        assert_eq!(h.bounds, vec![0.1, 0.5, 1.0]);

        h.observe(0.05);
        h.observe(0.1);
        h.observe(0.7);
        h.observe(3.0);

        assert_eq!(h.bucket_counts, vec![2, 0, 1, 1]);
        assert_eq!(h.count, 4);
        assert_eq!(h.min, Some(0.05));
        assert_eq!(h.max, Some(3.0));
        assert!((h.sum - 3.85).abs() < 1e-9);
    }

    #[test]
    fn test_record_kind() {
        let log: SignalRecord = LogRecord::new(Severity::Info, "hello").into();
        assert_eq!(log.kind(), SignalKind::Log);

        for kind in SignalKind::ALL {
            assert_eq!(SignalKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(SignalKind::from_wire(0), None);
    }

    #[test]
    fn test_batch_shares_records_on_clone() {
        let records = vec![SignalRecord::Log(LogRecord::new(Severity::Warn, "a"))];
        let batch = Batch::new(SignalKind::Log, records);
        let retry = batch.clone();
        assert!(std::ptr::eq(batch.records().as_ptr(), retry.records().as_ptr()));
        assert_eq!(retry.len(), 1);
    }
}
