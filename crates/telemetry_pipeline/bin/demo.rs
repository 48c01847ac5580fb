//! # Telemetry Pipeline Demo
//!
//! Replays the request mix of a small instrumented HTTP service against the
//! pipeline. Handlers are simulated (sleeps and random outcomes); every
//! request still produces the spans, metric points and log records a real
//! service would.
//!
//! Simulated endpoints:
//!
//! | Route | Telemetry |
//! |---|---|
//! | `GET /` | log |
//! | `GET /api/users/{id}` | `get_user` span, `999` answers 404 with an error log |
//! | `POST /api/orders` | `create_order` span with a nested `external_api_call` |
//! | `GET /api/external` | client span for an outbound call that sometimes fails (502) |
//! | `GET /api/slow` | `slow_operation` span with five `step_N` children |
//! | `GET /health` | debug log only (below the bridged level) |
//!
//! ## Running
//!
//! ```bash
//! # Against an in-process collector
//! cargo run -p telemetry_pipeline --bin demo -- --local-sink
//!
//! # Print records as JSON lines instead of exporting
//! cargo run -p telemetry_pipeline --bin demo -- --stdout --requests 5
//!
//! # Against a real collector (see PipelineConfig for the variables)
//! OTEL_EXPORTER_OTLP_ENDPOINT=collector:4317 cargo run -p telemetry_pipeline --bin demo
//! ```

#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry_pipeline::{
    HttpInstrumentation, LocalCollector, OutboundCallInterceptor, PipelineConfig, RequestInterceptor,
    SignalKind, SpanContext, SpanKind, StdoutExporter, TelemetryLogLayer, TelemetryProvider,
    TransportSecurity,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Simulated instrumented service emitting spans, metrics and logs
#[derive(Parser, Debug)]
#[command(name = "demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of simulated requests
    #[arg(short = 'n', long, default_value_t = 30)]
    requests: usize,

    /// Requests in flight at once
    #[arg(short, long, default_value_t = 4)]
    concurrency: usize,

    /// Export to an in-process collector on a loopback port
    #[arg(long, conflicts_with = "stdout")]
    local_sink: bool,

    /// Print records to stdout instead of exporting them
    #[arg(long)]
    stdout: bool,

    /// Multiplier for simulated processing time (0.1 = ten times faster)
    #[arg(long, default_value_t = 1.0)]
    time_scale: f64,

    /// Seconds to wait for the final flush
    #[arg(long, env = "TELEMETRY_SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
enum Request {
    Root,
    GetUser(i64),
    CreateOrder(Vec<(String, f64)>),
    External,
    Slow,
    Health,
}

impl Request {
    fn random() -> Self {
        let mut rng = rand::thread_rng();
        match rng.gen_range(0..6) {
            0 => Self::Root,
            1 => Self::GetUser(if rng.gen_bool(0.25) { 999 } else { rng.gen_range(1..=500) }),
            2 => Self::CreateOrder(
                (0..rng.gen_range(1..=4))
                    .map(|i| (format!("item-{}", i), f64::from(rng.gen_range(100..5000_u32)) / 100.0))
                    .collect(),
            ),
            3 => Self::External,
            4 => Self::Slow,
            _ => Self::Health,
        }
    }

    fn method(&self) -> &'static str {
        match self {
            Self::CreateOrder(_) => "POST",
            _ => "GET",
        }
    }

    fn route(&self) -> &'static str {
        match self {
            Self::Root => "/",
            Self::GetUser(_) => "/api/users/{user_id}",
            Self::CreateOrder(_) => "/api/orders",
            Self::External => "/api/external",
            Self::Slow => "/api/slow",
            Self::Health => "/health",
        }
    }
}

struct App {
    http: HttpInstrumentation,
    time_scale: f64,
}

fn hex_trace(ctx: &SpanContext) -> String {
    format!("{:032x}", ctx.trace_id)
}

impl App {
    /// Sleeps for a random simulated duration; returns the unscaled seconds.
    async fn work(&self, min_secs: f64, max_secs: f64) -> f64 {
        let secs = rand::thread_rng().gen_range(min_secs..max_secs);
        tokio::time::sleep(Duration::from_secs_f64(secs * self.time_scale)).await;
        secs
    }

    async fn handle(&self, request: Request) -> u16 {
        let scope = self.http.on_request_start(request.method(), request.route());
        let ctx = scope.context();

        let (status, body) = match request {
            Request::Root => self.root(&ctx),
            Request::GetUser(user_id) => self.get_user(&ctx, user_id).await,
            Request::CreateOrder(items) => self.create_order(&ctx, &items).await,
            Request::External => self.call_external(&ctx).await,
            Request::Slow => self.slow_operation(&ctx).await,
            Request::Health => self.health(),
        };

        debug!(status, body = %body, route = scope.route(), "request handled");
        self.http.on_request_end(scope, status);
        status
    }

    fn root(&self, ctx: &SpanContext) -> (u16, Value) {
        info!(trace_id = %hex_trace(ctx), span_id = ctx.span_id, "Root endpoint called");
        (200, json!({ "message": "Hello from the instrumented demo service!" }))
    }

    async fn get_user(&self, parent: &SpanContext, user_id: i64) -> (u16, Value) {
        let mut span = self
            .http
            .tracer()
            .start_span("get_user", SpanKind::Internal, Some(parent));
        span.set_attribute("user.id", user_id);
        let ctx = span.context();
        info!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "Fetching user {}", user_id);

        let processing = self.work(0.1, 0.5).await;
        span.set_attribute("processing_seconds", processing);

        if user_id == 999 {
            error!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "User {} not found", user_id);
            span.record_error("User not found");
            return (404, json!({ "detail": "User not found" }));
        }

        info!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "Successfully retrieved user {}", user_id);
        (
            200,
            json!({
                "id": user_id,
                "name": format!("User {}", user_id),
                "email": format!("user{}@example.com", user_id),
            }),
        )
    }

    async fn create_order(&self, parent: &SpanContext, items: &[(String, f64)]) -> (u16, Value) {
        let tracer = self.http.tracer();
        let mut span = tracer.start_span("create_order", SpanKind::Internal, Some(parent));
        let order_id = rand::thread_rng().gen_range(1000..=9999_i64);
        span.set_attribute("order.id", order_id);
        span.set_attribute("order.items_count", items.len() as i64);
        let ctx = span.context();
        info!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "Creating order {}", order_id);

        self.work(0.2, 1.0).await;

        {
            let validation = tracer.start_span("external_api_call", SpanKind::Internal, Some(&ctx));
            let vctx = validation.context();
            info!(
                trace_id = %hex_trace(&vctx),
                span_id = vctx.span_id,
                "Making external API call for order validation"
            );
            tokio::time::sleep(Duration::from_secs_f64(0.1 * self.time_scale)).await;
        }

        let total: f64 = items.iter().map(|(_, price)| price).sum();
        info!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "Order {} created successfully", order_id);
        (
            200,
            json!({
                "id": order_id,
                "status": "created",
                "items": items.iter().map(|(name, price)| json!({ "name": name, "price": price })).collect::<Vec<_>>(),
                "total": total,
            }),
        )
    }

    async fn call_external(&self, parent: &SpanContext) -> (u16, Value) {
        let mut span = self
            .http
            .tracer()
            .start_span("call_external", SpanKind::Internal, Some(parent));
        let ctx = span.context();
        info!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "Calling external service");

        let call = self.http.on_call_start(Some(&ctx), "GET", "https://httpbin.org/json");
        self.work(0.05, 0.4).await;
        let reachable = rand::thread_rng().gen_bool(0.8);

        if reachable {
            self.http.on_call_end(call, Ok(200));
            info!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "External service call successful");
            (200, json!({ "status": "success", "external_data": { "slideshow": { "title": "Sample" } } }))
        } else {
            let message = "connection reset by peer";
            self.http.on_call_end(call, Err(message));
            error!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "External service call failed: {}", message);
            span.record_error(message);
            (502, json!({ "detail": "External service error" }))
        }
    }

    async fn slow_operation(&self, parent: &SpanContext) -> (u16, Value) {
        let tracer = self.http.tracer();
        let mut span = tracer.start_span("slow_operation", SpanKind::Internal, Some(parent));
        let ctx = span.context();
        info!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "Starting slow operation");

        for step in 1..=5 {
            let step_span = tracer.start_span(format!("step_{}", step), SpanKind::Internal, Some(&ctx));
            let sctx = step_span.context();
            info!(trace_id = %hex_trace(&sctx), span_id = sctx.span_id, "Processing step {}", step);
            let duration = self.work(0.1, 0.3).await;
            step_span.end();
            span.set_attribute(format!("step.{}.duration", step), duration);
        }

        info!(trace_id = %hex_trace(&ctx), span_id = ctx.span_id, "Slow operation completed");
        (200, json!({ "status": "completed", "steps": 5 }))
    }

    fn health(&self) -> (u16, Value) {
        debug!("Health check called");
        (200, json!({ "status": "healthy", "service": "telemetry-demo" }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env().context("loading pipeline configuration")?;

    let sink = if cli.local_sink {
        let sink = LocalCollector::bind_with("127.0.0.1:0", |request| {
            debug!(
                kind = %request.kind,
                records = request.records.len(),
                service = %request.resource.service_name,
                "local collector received batch"
            );
            telemetry_pipeline::wire::ExportResponse::accepted(request.records.len())
        })
        .await
        .context("binding local collector")?;
        config.collector_endpoint = sink.endpoint();
        config.security = TransportSecurity::Plaintext;
        Some(sink)
    } else {
        None
    };

    let telemetry = if cli.stdout {
        TelemetryProvider::with_shared_exporter(&config, Arc::new(StdoutExporter::new(false)))
    } else {
        TelemetryProvider::connect(&config).context("building telemetry pipeline")?
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(TelemetryLogLayer::new(Arc::clone(telemetry.provider(SignalKind::Log))))
        .init();

    info!(
        service = %config.resource.service_name,
        endpoint = %config.collector_endpoint,
        overflow_policy = %config.overflow_policy,
        requests = cli.requests,
        "demo service starting up"
    );

    let app = Arc::new(App {
        http: HttpInstrumentation::new(&telemetry),
        time_scale: cli.time_scale.max(0.0),
    });

    let started = Instant::now();
    let mut in_flight = JoinSet::new();
    let mut statuses: Vec<u16> = Vec::with_capacity(cli.requests);
    for _ in 0..cli.requests {
        if in_flight.len() >= cli.concurrency.max(1) {
            if let Some(done) = in_flight.join_next().await {
                statuses.push(done.context("request task panicked")?);
            }
        }
        let app = Arc::clone(&app);
        let request = Request::random();
        in_flight.spawn(async move { app.handle(request).await });
    }
    while let Some(done) = in_flight.join_next().await {
        statuses.push(done.context("request task panicked")?);
    }

    info!("demo service shutting down");
    let timeout = Duration::from_secs(cli.shutdown_timeout);
    if let Err(e) = telemetry.shutdown(timeout).await {
        error!(error = %e, "telemetry shutdown did not finish; buffered records may be lost");
    }

    let ok = statuses.iter().filter(|s| **s < 400).count();
    println!();
    println!("=== Demo Summary ===");
    println!("Requests:          {} ({} ok, {} failed)", statuses.len(), ok, statuses.len() - ok);
    println!("Elapsed:           {:.2?}", started.elapsed());
    for kind in SignalKind::ALL {
        let provider = telemetry.provider(kind);
        let buffer = provider.buffer_metrics();
        let export = provider.export_metrics();
        println!(
            "{:<7} accepted {:>5} | exported {:>5} in {:>3} batches | dropped {:>4} (buffer) {:>4} (export)",
            kind.as_str(),
            buffer.accepted(),
            export.records_exported(),
            export.batches_exported(),
            buffer.total_dropped(),
            export.records_dropped(),
        );
    }
    if let Some(sink) = &sink {
        println!(
            "Local collector:   {} spans, {} metric points, {} log records over {} connection(s)",
            sink.record_count(SignalKind::Span),
            sink.record_count(SignalKind::Metric),
            sink.record_count(SignalKind::Log),
            sink.connections(),
        );
    }

    Ok(())
}
