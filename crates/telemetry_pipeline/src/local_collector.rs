//! In-process collector that speaks the wire protocol.
//!
//! Accepts connections on a loopback port, decodes request frames and
//! answers each with whatever the responder decides. Used by the demo's
//! `--local-sink` mode and by tests that need a real socket peer.

use crate::signal::SignalKind;
use crate::wire::{self, ExportRequest, ExportResponse, ResponseStatus, WireError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Responder = dyn Fn(&ExportRequest) -> ExportResponse + Send + Sync;

struct Shared {
    responder: Box<Responder>,
    requests: Mutex<Vec<ExportRequest>>,
    connections: AtomicUsize,
}

/// Loopback collector. Stops accepting when dropped.
pub struct LocalCollector {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl LocalCollector {
    /// Binds a collector that accepts every batch.
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        Self::bind_with(addr, |request| ExportResponse::accepted(request.records.len())).await
    }

    /// Binds a collector whose replies come from `responder`.
    pub async fn bind_with<F>(addr: &str, responder: F) -> std::io::Result<Self>
    where
        F: Fn(&ExportRequest) -> ExportResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        debug!(%addr, "local collector listening");

        Ok(Self {
            addr,
            shared,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` suitable for a collector exporter
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Every request received so far, in arrival order
    pub fn requests(&self) -> Vec<ExportRequest> {
        self.shared
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records of `kind` received so far, whatever the reply was
    pub fn record_count(&self, kind: SignalKind) -> usize {
        self.shared
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.records.len())
            .sum()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }
}

impl Drop for LocalCollector {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                shared.connections.fetch_add(1, Ordering::Relaxed);
                trace!(%peer, "collector connection accepted");
                tokio::spawn(serve_connection(stream, Arc::clone(&shared)));
            }
            Err(e) => {
                debug!(error = %e, "local collector accept failed");
                return;
            }
        }
    }
}

async fn serve_connection(mut stream: TcpStream, shared: Arc<Shared>) {
    loop {
        let frame = match wire::read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(WireError::Io(_)) => return,
            Err(e) => {
                debug!(error = %e, "dropping connection after bad frame");
                return;
            }
        };

        let kind = frame.kind;
        let response = match frame.into_request() {
            Ok(request) => {
                let response = (shared.responder)(&request);
                shared
                    .requests
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(request);
                response
            }
            Err(e) => ExportResponse::refused(ResponseStatus::Rejected, e.to_string()),
        };

        let reply = match wire::encode_response(kind, &response) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "failed to encode collector reply");
                return;
            }
        };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}
