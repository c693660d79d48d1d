//! Per-connection control loop.
//!
//! ```text
//!  Connecting ──► register + queue Init ──► (startup delay) ──► Active
//!                                                                 │
//!       ┌──────────────── recv frame ◄────────────────────────────┤
//!       ▼                                                         │
//!  decode ── bad ──► log, drop frame ─────────────────────────────┤
//!       │                                                         │
//!       └─ ok ──► apply to GridStore ─┬─► broadcast to others ────┘
//!                                     │
//!  close / transport error ──────────► Closed (deregistered once)
//! ```
//!
//! A session task only yields at two points: waiting for the next inbound
//! frame and, inside the writer task, waiting for a socket write. Frames to
//! the peer go through its outbound queue, so the Init snapshot and every
//! later broadcast reach the peer in queue order.
//!
//! Broadcasts are enqueued from the grid's commit hook, so peers receive
//! updates in commit order and end on the same color the grid holds.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::BroadcastHub;
use crate::grid::{CellUpdate, GridStore};
use crate::protocol::{CanvasMessage, ProtocolError, WireFormat};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};

/// How long a closing session waits for its queued frames to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one session, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Session-level failures. Only transport errors end a session early.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("could not encode init snapshot: {0}")]
    Init(#[from] ProtocolError),
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub startup_delay: Duration,
    pub init_format: WireFormat,
    pub outbound_capacity: usize,
}

/// Traffic counters shared by all sessions.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub total_connections: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_bytes: AtomicU64,
    pub decode_failures: AtomicU64,
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub grid: Arc<GridStore>,
    pub hub: Arc<BroadcastHub>,
    pub counters: Arc<SessionCounters>,
    pub config: SessionConfig,
}

/// Deregisters the connection when the session ends, however it ends.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove(&self.id).is_some() {
            log::debug!("Connection {} deregistered", self.id);
        }
    }
}

/// One peer's session.
pub struct Session {
    ctx: SessionContext,
    conn: Connection,
    state: SessionState,
}

impl Session {
    /// Drive a WebSocket connection through its whole lifecycle.
    pub async fn run<S>(
        ctx: SessionContext,
        ws: WebSocketStream<S>,
        addr: Option<SocketAddr>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (conn, mut outbound_rx) = Connection::channel(addr, ctx.config.outbound_capacity);

        // Writer: drain the outbound queue until every sender is gone or
        // the socket fails.
        let writer_id = conn.id();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    log::debug!("Write to {writer_id} failed: {e}");
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut session = Session {
            ctx,
            conn,
            state: SessionState::Connecting,
        };
        let registration = session.register()?;

        if !session.ctx.config.startup_delay.is_zero() {
            tokio::time::sleep(session.ctx.config.startup_delay).await;
        }
        session.transition(SessionState::Active);

        let result = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    session.count(text.len());
                    session.handle_text(text.as_str()).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    session.count(bytes.len());
                    session.handle_binary(&bytes).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection {} closed by peer", session.conn.id());
                    break Ok(());
                }
                // Pings are answered by the transport
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("WebSocket error on {}: {e}", session.conn.id());
                    break Err(SessionError::Transport(e));
                }
            }
        };

        session.transition(SessionState::Closed);
        // Deregister and drop our sender so the writer drains and exits.
        drop(registration);
        drop(session);
        let abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            abort.abort();
        }
        result
    }

    /// Register with the hub and queue the Init snapshot atomically, so no
    /// broadcast can overtake the snapshot.
    fn register(&self) -> Result<Registration, SessionError> {
        let registry = self.ctx.hub.registry().clone();
        let grid = self.ctx.grid.clone();
        let format = self.ctx.config.init_format;

        let (queued, _) = registry.add_with(self.conn.clone(), |conn| -> Result<usize, ProtocolError> {
            let cells = grid.snapshot().non_background();
            let count = cells.len();
            let frame: Message = CanvasMessage::Init(cells).encode(format)?.into();
            conn.try_send(frame)
                .map(|_| count)
                .map_err(|_| ProtocolError::ConnectionClosed)
        });
        let registration = Registration {
            registry,
            id: self.conn.id(),
        };

        let count = queued?;
        self.ctx
            .counters
            .total_connections
            .fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Connection {} ({}) registered, sending init with {count} pixels",
            self.conn.id(),
            self.conn
                .addr()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string()),
        );
        Ok(registration)
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("Connection {}: {:?} -> {:?}", self.conn.id(), self.state, next);
        self.state = next;
    }

    fn count(&self, len: usize) {
        let counters = &self.ctx.counters;
        counters.total_messages.fetch_add(1, Ordering::Relaxed);
        counters.total_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn reject(&self, e: &ProtocolError) {
        self.ctx
            .counters
            .decode_failures
            .fetch_add(1, Ordering::Relaxed);
        log::warn!("Dropping frame from {}: {e}", self.conn.id());
    }

    async fn handle_text(&self, text: &str) {
        match CanvasMessage::decode_text(text) {
            Ok(CanvasMessage::PixelUpdate(cell)) => {
                let frame = match CanvasMessage::PixelUpdate(cell).encode(WireFormat::Text) {
                    Ok(frame) => Message::from(frame),
                    Err(e) => {
                        log::error!("Failed to encode pixel update: {e}");
                        return;
                    }
                };
                self.apply_pixel(cell, frame).await;
            }
            Ok(CanvasMessage::ImageUpdate(cells)) => {
                self.apply_image(cells, Message::text(text.to_string())).await;
            }
            Ok(other) => {
                log::debug!(
                    "Ignoring server-only {:?} from {}",
                    other.message_type(),
                    self.conn.id()
                );
            }
            Err(e) => self.reject(&e),
        }
    }

    async fn handle_binary(&self, bytes: &[u8]) {
        match CanvasMessage::decode_binary(bytes) {
            Ok(CanvasMessage::PixelUpdate(cell)) => {
                self.apply_pixel(cell, Message::binary(bytes.to_vec())).await;
            }
            Ok(CanvasMessage::ImageUpdate(cells)) => {
                self.apply_image(cells, Message::binary(bytes.to_vec())).await;
            }
            Ok(other) => {
                log::debug!("Ignoring binary {:?} from {}", other.message_type(), self.conn.id());
            }
            Err(e) => self.reject(&e),
        }
    }

    /// Commit one cell and forward `frame` to the other peers.
    async fn apply_pixel(&self, cell: CellUpdate, frame: Message) {
        let hub = &self.ctx.hub;
        let id = self.conn.id();
        if let Err(e) = self
            .ctx
            .grid
            .apply_with(cell, || hub.broadcast(&frame, Some(id)))
            .await
        {
            log::warn!("Rejected pixel from {id}: {e}");
        }
    }

    /// Replace the grid with a full image and forward the original frame to
    /// the other peers. The frame is already encoded, so forwarding is a
    /// queue push inside the commit; the next inbound frame waits for both.
    async fn apply_image(&self, cells: Vec<CellUpdate>, raw: Message) {
        let hub = &self.ctx.hub;
        let id = self.conn.id();
        let (applied, report) = self
            .ctx
            .grid
            .replace_all_with(&cells, || hub.broadcast(&raw, Some(id)))
            .await;
        log::debug!(
            "Image from {id}: {applied}/{} cells applied, forwarded to {} peers",
            cells.len(),
            report.delivered
        );
    }
}
