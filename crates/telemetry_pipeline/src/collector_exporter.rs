//! Exporter that ships batches to a remote collector over TCP, optionally TLS.
//!
//! One connection per exporter is opened lazily and reused for every batch.
//! A connection that fails mid-exchange, or whose exchange is cancelled by
//! an attempt timeout, is discarded; the next export dials again.

use crate::error::{ConfigError, ExportError};
use crate::exporter::SignalExporter;
use crate::signal::{Batch, Resource, SignalKind};
use crate::wire::{self, ResponseStatus, WireError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// How the exporter secures its connection to the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSecurity {
    Plaintext,
    Tls {
        /// PEM bundle of CA certificates trusted for the collector
        ca_cert_path: PathBuf,
        /// Name to verify the certificate against; defaults to the endpoint host
        server_name: Option<String>,
    },
}

trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

struct TlsTarget {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

pub struct CollectorExporter {
    name: String,
    endpoint: String,
    resource: Arc<Resource>,
    auth_token: Option<String>,
    tls: Option<TlsTarget>,
    connection: tokio::sync::Mutex<Option<Box<dyn Connection>>>,
}

impl CollectorExporter {
    /// Builds an exporter for `kind`. No connection is made until the first export.
    ///
    /// `endpoint` is `host:port`; a leading `http://` or `https://` is ignored.
    pub fn new(
        kind: SignalKind,
        endpoint: &str,
        security: &TransportSecurity,
        resource: Arc<Resource>,
        auth_token: Option<String>,
    ) -> Result<Self, ConfigError> {
        let endpoint = strip_scheme(endpoint).to_string();
        if endpoint.is_empty() {
            return Err(ConfigError::Invalid("collector endpoint is empty".into()));
        }

        let tls = match security {
            TransportSecurity::Plaintext => None,
            TransportSecurity::Tls {
                ca_cert_path,
                server_name,
            } => {
                let name = server_name.clone().unwrap_or_else(|| host_of(&endpoint).to_string());
                Some(TlsTarget {
                    connector: tls_connector(ca_cert_path)?,
                    server_name: ServerName::try_from(name.clone()).map_err(|e| {
                        ConfigError::InvalidValue {
                            key: "TELEMETRY_TLS_SERVER_NAME",
                            value: name,
                            reason: e.to_string(),
                        }
                    })?,
                })
            }
        };

        Ok(Self {
            name: format!("collector:{}", kind),
            endpoint,
            resource,
            auth_token,
            tls,
            connection: tokio::sync::Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, ExportError> {
        let tcp = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| ExportError::Transport(format!("connect {}: {}", self.endpoint, e)))?;
        tcp.set_nodelay(true)
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        match &self.tls {
            None => Ok(Box::new(tcp)),
            Some(target) => {
                let stream = target
                    .connector
                    .connect(target.server_name.clone(), tcp)
                    .await
                    .map_err(|e| ExportError::Transport(format!("tls handshake: {}", e)))?;
                Ok(Box::new(stream))
            }
        }
    }

    async fn exchange(
        conn: &mut Box<dyn Connection>,
        frame: &[u8],
    ) -> Result<wire::ExportResponse, ExportError> {
        conn.write_all(frame)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        conn.flush()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        let reply = wire::read_frame(conn.as_mut()).await.map_err(|e| match e {
            WireError::Io(io) => ExportError::Transport(io.to_string()),
            other => ExportError::Protocol(other.to_string()),
        })?;
        reply
            .into_response()
            .map_err(|e| ExportError::Protocol(e.to_string()))
    }
}

impl SignalExporter for CollectorExporter {
    async fn export(&self, batch: Batch) -> Result<(), ExportError> {
        let frame = wire::encode_request(
            &self.resource,
            batch.kind(),
            self.auth_token.as_deref(),
            batch.records(),
        )
        .map_err(|e| ExportError::Serialization(e.to_string()))?;

        let mut slot = self.connection.lock().await;
        // Taken out for the exchange; only a clean exchange puts it back.
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!(endpoint = %self.endpoint, tls = self.is_tls(), "connecting to collector");
                self.connect().await?
            }
        };

        let response = match Self::exchange(&mut conn, &frame).await {
            Ok(response) => response,
            Err(e) => {
                warn!(exporter = %self.name, error = %e, "collector connection dropped");
                return Err(e);
            }
        };
        *slot = Some(conn);
        drop(slot);

        match response.status {
            ResponseStatus::Accepted => {
                if (response.accepted as usize) < batch.len() {
                    debug!(
                        exporter = %self.name,
                        sent = batch.len(),
                        accepted = response.accepted,
                        "collector accepted part of the batch"
                    );
                }
                Ok(())
            }
            ResponseStatus::Retryable => Err(ExportError::Unavailable(response.message)),
            ResponseStatus::Rejected => Err(ExportError::Rejected(response.message)),
            ResponseStatus::Unauthenticated => Err(ExportError::Unauthenticated(response.message)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub(crate) fn strip_scheme(endpoint: &str) -> &str {
    let trimmed = endpoint.trim();
    let without = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without.trim_end_matches('/')
}

fn host_of(endpoint: &str) -> &str {
    let host = endpoint.rsplit_once(':').map_or(endpoint, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn tls_connector(ca_cert_path: &Path) -> Result<TlsConnector, ConfigError> {
    let tls_error = |reason: String| ConfigError::Tls {
        path: ca_cert_path.display().to_string(),
        reason,
    };

    let file = std::fs::File::open(ca_cert_path).map_err(|e| tls_error(e.to_string()))?;
    let mut reader = std::io::BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| tls_error(e.to_string()))?;
        roots.add(cert).map_err(|e| tls_error(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(tls_error("no certificates found".into()));
    }

    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
