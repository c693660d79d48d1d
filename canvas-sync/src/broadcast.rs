//! Fan-out of encoded frames to every connected peer.
//!
//! Each recipient owns a bounded outbound queue drained by its own writer
//! task. A broadcast only enqueues (`try_send`), so it returns after every
//! current member has been offered the frame, and a peer whose socket is
//! stalled just fills its own queue. Failures are counted and logged;
//! removing dead peers is the session's job, not the hub's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{CanvasMessage, ProtocolError, WireFormat, WireFrame};
use crate::registry::{ConnectionId, ConnectionRegistry, DeliveryError};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
    pub active_peers: usize,
}

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Atomic broadcast stats: lock-free on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            failed_deliveries: AtomicU64::new(0),
        }
    }
}

impl From<WireFrame> for Message {
    fn from(frame: WireFrame) -> Self {
        match frame {
            WireFrame::Text(text) => Message::text(text),
            WireFrame::Binary(bytes) => Message::binary(bytes),
        }
    }
}

/// Broadcast hub over a shared [`ConnectionRegistry`].
pub struct BroadcastHub {
    registry: Arc<ConnectionRegistry>,
    stats: AtomicBroadcastStats,
}

impl BroadcastHub {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Offer `msg` to every member except `excluding`.
    ///
    /// Per-recipient failures never abort delivery to the rest.
    pub fn broadcast(&self, msg: &Message, excluding: Option<ConnectionId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        self.registry.for_each(|conn| {
            if Some(conn.id()) == excluding {
                return;
            }
            match conn.try_send(msg.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    match e {
                        DeliveryError::QueueFull => {
                            log::warn!("Peer {} is lagging, dropped frame", conn.id())
                        }
                        DeliveryError::Closed => {
                            log::debug!("Peer {} already closed, skipped frame", conn.id())
                        }
                    }
                }
            }
        });

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .failed_deliveries
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    /// Encode once, then broadcast.
    pub fn broadcast_message(
        &self,
        msg: &CanvasMessage,
        format: WireFormat,
        excluding: Option<ConnectionId>,
    ) -> Result<BroadcastReport, ProtocolError> {
        let frame: Message = msg.encode(format)?.into();
        Ok(self.broadcast(&frame, excluding))
    }

    /// Broadcast statistics snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.stats.failed_deliveries.load(Ordering::Relaxed),
            active_peers: self.registry.len(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}
