//! Producer-side telemetry pipeline
//!
//! Buffers, batches and exports spans, metric points and log records from an
//! application process to a remote collector without blocking request
//! handling. Each signal kind gets its own bounded buffer and background
//! export task:
//!
//! ```text
//! emit ──▶ BoundedBuffer ──▶ BatchProcessor task ──▶ RetryingExporter ──▶ CollectorExporter ──▶ collector
//!          (overflow policy)  (interval / watermark)  (backoff + jitter)   (TCP or TLS frames)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use telemetry_pipeline::{PipelineConfig, SpanKind, TelemetryProvider};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let telemetry = TelemetryProvider::connect(&config)?;
//!
//!     let tracer = telemetry.tracer();
//!     let mut span = tracer.start_span("get_user", SpanKind::Internal, None);
//!     span.set_attribute("user.id", 42);
//!     telemetry.logger().info("Fetching user 42", Some(&span.context()));
//!     span.end();
//!
//!     // Dropping the provider also flushes, but in the background; records
//!     // still buffered are lost if the runtime exits before that finishes.
//!     telemetry.shutdown(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

pub mod batch_processor;
pub mod buffer;
pub mod collector_exporter;
pub mod config;
pub mod error;
pub mod exporter;
pub mod instrumentation;
mod invariants;
pub mod local_collector;
pub mod log_bridge;
pub mod provider;
pub mod resilient_exporter;
pub mod signal;
pub mod wire;

// Re-export main types
pub use batch_processor::{BatchConfig, BatchProcessor, ExportMetrics, ProcessorState};
pub use buffer::{BoundedBuffer, BufferConfig, BufferMetrics, Enqueued, OverflowPolicy};
pub use collector_exporter::{CollectorExporter, TransportSecurity};
pub use config::PipelineConfig;
pub use error::{ConfigError, EnqueueError, ExportError, TimedOut};
pub use exporter::{NullExporter, SignalExporter, SignalExporterBoxed, StdoutExporter};
pub use instrumentation::{
    ActiveSpan, Counter, Histogram, HttpInstrumentation, Logger, Meter, OutboundCallInterceptor,
    RequestInterceptor, SpanContext, Tracer, UpDownCounter,
};
pub use local_collector::LocalCollector;
pub use log_bridge::TelemetryLogLayer;
pub use provider::{EmitOutcome, Provider, TelemetryProvider};
pub use resilient_exporter::{RetryConfig, RetryingExporter};
pub use signal::{
    AttributeValue, Attributes, Batch, HistogramBuckets, InstrumentKind, LogRecord, MetricPoint,
    MetricValue, Resource, Severity, SignalKind, SignalRecord, Span, SpanKind, SpanStatus,
};
