//! WebSocket canvas server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                           ┌── GridStore ── CanvasStore
//!            ├── Session (one task each) ┤
//! Client B ──┘                           └── BroadcastHub
//!                                                 │
//!                                         ConnectionRegistry
//!                                                 │
//!                                  ┌──────────────┼──────────────┐
//!                                  ▼              ▼              ▼
//!                               Client A       Client B       Client C
//! ```
//!
//! The grid store, registry and hub are built once here and shared by
//! reference with every session. Sessions depend on them; they never
//! depend back on the session or the server.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastHub, BroadcastReport};
use crate::config::ServerConfig;
use crate::grid::{CellUpdate, GridStore};
use crate::protocol::{CanvasMessage, WireFormat};
use crate::registry::ConnectionRegistry;
use crate::session::{Session, SessionConfig, SessionContext, SessionCounters};
use crate::storage::{CanvasStore, FileStore, MemoryStore};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub decode_failures: u64,
    pub persist_failures: u64,
}

/// Unvalidated cell from an out-of-band request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct RawCell {
    pub x: i64,
    pub y: i64,
    pub r: i64,
    pub g: i64,
    pub b: i64,
}

/// Server-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no pixel data provided")]
    EmptyBatch,
}

/// The canvas server.
pub struct CanvasServer {
    config: ServerConfig,
    grid: Arc<GridStore>,
    hub: Arc<BroadcastHub>,
    counters: Arc<SessionCounters>,
}

impl CanvasServer {
    /// Create a server, loading the canvas from the configured store.
    pub fn new(config: ServerConfig) -> Self {
        let store: Arc<dyn CanvasStore> = match &config.storage_path {
            Some(path) => Arc::new(FileStore::new(path.clone(), config.storage_format)),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, store)
    }

    /// Create a server over an explicit store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn CanvasStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            config,
            grid: Arc::new(GridStore::open(store)),
            hub: Arc::new(BroadcastHub::new(registry)),
            counters: Arc::new(SessionCounters::default()),
        }
    }

    /// Create with default configuration, in-memory only.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig {
            storage_path: None,
            ..ServerConfig::default()
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Canvas server listening on ws://{}{}",
            listener.local_addr()?,
            self.config.endpoint_path
        );
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.session_context();
            let endpoint = self.config.endpoint_path.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, endpoint, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            grid: self.grid.clone(),
            hub: self.hub.clone(),
            counters: self.counters.clone(),
            config: SessionConfig {
                startup_delay: self.config.startup_delay,
                init_format: self.config.init_format,
                outbound_capacity: self.config.outbound_capacity,
            },
        }
    }

    /// Handshake (rejecting other paths with 404), then hand off to a session.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        endpoint: String,
        ctx: SessionContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == endpoint {
                Ok(resp)
            } else {
                log::debug!("Rejecting handshake for {} from {addr}", req.uri().path());
                let mut err = ErrorResponse::new(Some(format!("no canvas at {}", req.uri().path())));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
        log::info!("WebSocket connection established from {addr}");

        Session::run(ctx, ws_stream, Some(addr)).await?;
        Ok(())
    }

    /// Blank the canvas and tell every peer to do the same.
    pub async fn reset(&self) -> BroadcastReport {
        let report = self
            .grid
            .reset_with(|| self.broadcast_text(&CanvasMessage::Reset))
            .await;
        log::info!("Canvas reset, notified {} peers", report.delivered);
        report
    }

    /// Replace the canvas from an out-of-band batch.
    ///
    /// Cells outside the canvas or color domain are dropped. The valid ones
    /// replace the whole canvas (unlisted cells become background); peers
    /// get a reset followed by one pixel update per applied cell. Returns
    /// the number of applied cells.
    pub async fn bulk_replace(&self, cells: &[RawCell]) -> Result<usize, ServerError> {
        if cells.is_empty() {
            return Err(ServerError::EmptyBatch);
        }
        let valid: Vec<CellUpdate> = cells
            .iter()
            .filter_map(|c| CellUpdate::try_from_raw(c.x, c.y, c.r, c.g, c.b).ok())
            .collect();
        if valid.len() < cells.len() {
            log::warn!("Bulk replace dropped {} invalid cells", cells.len() - valid.len());
        }

        let (applied, ()) = self
            .grid
            .replace_all_with(&valid, || {
                self.broadcast_text(&CanvasMessage::Reset);
                for cell in &valid {
                    self.broadcast_text(&CanvasMessage::PixelUpdate(*cell));
                }
            })
            .await;
        log::info!("Bulk replace applied {applied} cells");
        Ok(applied)
    }

    fn broadcast_text(&self, msg: &CanvasMessage) -> BroadcastReport {
        match msg.encode_text() {
            Ok(text) => self.hub.broadcast(&Message::text(text), None),
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", msg.message_type());
                BroadcastReport::default()
            }
        }
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.hub.registry().len(),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            persist_failures: self.grid.persist_failures(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn grid(&self) -> &Arc<GridStore> {
        &self.grid
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Encoding used for init snapshots.
    pub fn init_format(&self) -> WireFormat {
        self.config.init_format
    }
}
