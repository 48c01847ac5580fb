//! Pipeline configuration.
//!
//! Loaded from environment variables (and a `.env` file, if present) with
//! defaults for everything:
//!
//! | Variable | Default |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | `localhost:4317` |
//! | `OTEL_EXPORTER_OTLP_INSECURE` | `true` |
//! | `OTEL_EXPORTER_OTLP_CERTIFICATE` | unset (required when not insecure) |
//! | `TELEMETRY_TLS_SERVER_NAME` | endpoint host |
//! | `TELEMETRY_AUTH_TOKEN` | unset |
//! | `TELEMETRY_EXPORT_INTERVAL_MS` | `10000` |
//! | `TELEMETRY_BUFFER_CAPACITY` | `2048` |
//! | `TELEMETRY_OVERFLOW_POLICY` | `drop_oldest` |
//! | `TELEMETRY_BLOCK_TIMEOUT_MS` | `100` |
//! | `TELEMETRY_MAX_EXPORT_BATCH_SIZE` | `512` |
//! | `TELEMETRY_HIGH_WATERMARK` | batch size, capped at buffer capacity |
//! | `TELEMETRY_MAX_EXPORT_RETRIES` | `3` |
//! | `TELEMETRY_EXPORT_TIMEOUT_MS` | `10000` |
//! | `TELEMETRY_INITIAL_BACKOFF_MS` | `100` |
//! | `TELEMETRY_MAX_BACKOFF_MS` | `5000` |
//! | `OTEL_SERVICE_NAME` | `telemetry-demo` |
//! | `TELEMETRY_SERVICE_VERSION` | crate version |
//! | `TELEMETRY_DEPLOYMENT_ENVIRONMENT` | `development` |

use crate::batch_processor::BatchConfig;
use crate::buffer::{BufferConfig, OverflowPolicy};
use crate::collector_exporter::{strip_scheme, TransportSecurity};
use crate::error::ConfigError;
use crate::resilient_exporter::RetryConfig;
use crate::signal::Resource;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Everything needed to build a [`TelemetryProvider`](crate::TelemetryProvider).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Collector address as `host:port`
    pub collector_endpoint: String,
    pub security: TransportSecurity,
    /// Sent with every request when set
    pub auth_token: Option<String>,
    pub export_interval: Duration,
    pub buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub block_timeout: Duration,
    pub max_export_batch_size: usize,
    /// Early-export threshold. `None` means the batch size, capped at the buffer capacity.
    pub high_watermark: Option<usize>,
    pub max_export_retries: u32,
    /// Deadline for one export attempt
    pub export_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub resource: Resource,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collector_endpoint: "localhost:4317".to_string(),
            security: TransportSecurity::Plaintext,
            auth_token: None,
            export_interval: Duration::from_millis(10_000),
            buffer_capacity: 2048,
            overflow_policy: OverflowPolicy::DropOldest,
            block_timeout: Duration::from_millis(100),
            max_export_batch_size: 512,
            high_watermark: None,
            max_export_retries: 3,
            export_timeout: Duration::from_millis(10_000),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(5_000),
            resource: Resource::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads `.env` (if any), then reads the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparsable value or the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let collector_endpoint = get("OTEL_EXPORTER_OTLP_ENDPOINT")
            .map(|e| strip_scheme(&e).to_string())
            .unwrap_or(defaults.collector_endpoint);

        let insecure = match get("OTEL_EXPORTER_OTLP_INSECURE") {
            Some(v) => parse_bool("OTEL_EXPORTER_OTLP_INSECURE", &v)?,
            None => true,
        };
        let security = if insecure {
            TransportSecurity::Plaintext
        } else {
            let ca_cert_path = get("OTEL_EXPORTER_OTLP_CERTIFICATE").ok_or_else(|| {
                ConfigError::Invalid(
                    "OTEL_EXPORTER_OTLP_INSECURE=false requires OTEL_EXPORTER_OTLP_CERTIFICATE".into(),
                )
            })?;
            TransportSecurity::Tls {
                ca_cert_path: PathBuf::from(ca_cert_path),
                server_name: get("TELEMETRY_TLS_SERVER_NAME"),
            }
        };

        let max_export_batch_size = parse_or(&get, "TELEMETRY_MAX_EXPORT_BATCH_SIZE", defaults.max_export_batch_size)?;
        let overflow_policy = match get("TELEMETRY_OVERFLOW_POLICY") {
            Some(v) => {
                let parsed = v.parse::<OverflowPolicy>();
                parsed.map_err(|reason| ConfigError::InvalidValue {
                    key: "TELEMETRY_OVERFLOW_POLICY",
                    value: v,
                    reason,
                })?
            }
            None => defaults.overflow_policy,
        };

        let resource = Resource::new(
            get("OTEL_SERVICE_NAME").unwrap_or(defaults.resource.service_name),
            get("TELEMETRY_SERVICE_VERSION").unwrap_or(defaults.resource.service_version),
            get("TELEMETRY_DEPLOYMENT_ENVIRONMENT").unwrap_or(defaults.resource.deployment_environment),
        );

        let config = Self {
            collector_endpoint,
            security,
            auth_token: get("TELEMETRY_AUTH_TOKEN"),
            export_interval: millis_or(&get, "TELEMETRY_EXPORT_INTERVAL_MS", defaults.export_interval)?,
            buffer_capacity: parse_or(&get, "TELEMETRY_BUFFER_CAPACITY", defaults.buffer_capacity)?,
            overflow_policy,
            block_timeout: millis_or(&get, "TELEMETRY_BLOCK_TIMEOUT_MS", defaults.block_timeout)?,
            max_export_batch_size,
            high_watermark: parse_opt(&get, "TELEMETRY_HIGH_WATERMARK")?,
            max_export_retries: parse_or(&get, "TELEMETRY_MAX_EXPORT_RETRIES", defaults.max_export_retries)?,
            export_timeout: millis_or(&get, "TELEMETRY_EXPORT_TIMEOUT_MS", defaults.export_timeout)?,
            initial_backoff: millis_or(&get, "TELEMETRY_INITIAL_BACKOFF_MS", defaults.initial_backoff)?,
            max_backoff: millis_or(&get, "TELEMETRY_MAX_BACKOFF_MS", defaults.max_backoff)?,
            resource,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collector_endpoint.is_empty() {
            return Err(ConfigError::Invalid("collector endpoint is empty".into()));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer capacity must be at least 1".into()));
        }
        if self.max_export_batch_size == 0 {
            return Err(ConfigError::Invalid("max export batch size must be at least 1".into()));
        }
        if let Some(watermark) = self.high_watermark {
            if watermark == 0 || watermark > self.buffer_capacity {
                return Err(ConfigError::Invalid(format!(
                    "high watermark {} must be between 1 and the buffer capacity {}",
                    watermark, self.buffer_capacity
                )));
            }
        }
        if self.export_interval.is_zero() || self.export_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "export interval and export timeout must be positive".into(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::Invalid(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        if self.resource.service_name.is_empty() {
            return Err(ConfigError::Invalid("service name is empty".into()));
        }
        Ok(())
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            capacity: self.buffer_capacity,
            overflow_policy: self.overflow_policy,
            block_timeout: self.block_timeout,
            high_watermark: self.effective_high_watermark(),
        }
    }

    pub fn effective_high_watermark(&self) -> usize {
        self.high_watermark
            .unwrap_or_else(|| self.max_export_batch_size.min(self.buffer_capacity))
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            export_interval: self.export_interval,
            max_export_batch_size: self.max_export_batch_size,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_export_retries,
            initial_delay: self.initial_backoff,
            max_delay: self.max_backoff,
            attempt_timeout: self.export_timeout,
            ..RetryConfig::default()
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected true or false".into(),
        }),
    }
}

fn parse_opt<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|value| {
            let parsed = value.parse::<T>();
            parsed.map_err(|e| ConfigError::InvalidValue {
                key,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn millis_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}
