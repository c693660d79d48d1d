//! Set of live peer connections.
//!
//! Each [`Connection`] is a handle to a peer's outbound queue; the peer's
//! writer task drains the queue onto its socket. Registry membership is
//! guarded by a short-lived lock that is never held across an await or a
//! socket write, so a stalled peer cannot hold up anybody else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Unique identity of one connection.
pub type ConnectionId = Uuid;

/// Why a frame could not be queued for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// Handle to one peer's outbound queue.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    addr: Option<SocketAddr>,
    outbound: mpsc::Sender<Message>,
}

impl Connection {
    pub fn new(addr: Option<SocketAddr>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            outbound,
        }
    }

    /// New connection plus the receiving end of its bounded outbound queue.
    pub fn channel(addr: Option<SocketAddr>, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(addr, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, msg: Message) -> Result<(), DeliveryError> {
        self.outbound.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Concurrent set of connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    members: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns `false` if the id was already present.
    pub fn add(&self, conn: Connection) -> bool {
        self.add_with(conn, |_| ()).1
    }

    /// Register a connection, running `on_join` while membership is still
    /// exclusively locked. Nothing can be broadcast to the connection before
    /// `on_join` returns, so a frame it queues is the first one the peer
    /// sees.
    pub fn add_with<R>(&self, conn: Connection, on_join: impl FnOnce(&Connection) -> R) -> (R, bool) {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        let result = on_join(&conn);
        let inserted = members.insert(conn.id, conn).is_none();
        (result, inserted)
    }

    /// Remove a connection. Removing an absent id is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current membership.
    pub fn members(&self) -> Vec<Connection> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Visit a snapshot of the members taken at call time. Joins and
    /// leaves during the walk do not affect it.
    pub fn for_each(&self, mut f: impl FnMut(&Connection)) {
        for conn in self.members() {
            f(&conn);
        }
    }
}
