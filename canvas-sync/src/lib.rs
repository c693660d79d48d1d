//! # canvas-sync: Shared pixel canvas over WebSocket
//!
//! Keeps one authoritative 64×64 RGB canvas and relays every change to all
//! connected peers in real time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ CanvasClient│ ◄─────────────────► │ CanvasServer │
//! │ (per peer)  │   JSON or binary    │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │ one Session per peer
//!                              ┌─────────────┴─────────────┐
//!                              ▼                           ▼
//!                       ┌─────────────┐            ┌──────────────┐
//!                       │ GridStore   │            │ BroadcastHub │
//!                       │ (authority) │            │ (fan-out)    │
//!                       └──────┬──────┘            └──────┬───────┘
//!                              │                          │
//!                       ┌──────┴──────┐          ┌────────┴─────────┐
//!                       │ CanvasStore │          │ConnectionRegistry│
//!                       └─────────────┘          └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`grid`]: Canvas cells and the authoritative, persisted store
//! - [`protocol`]: JSON and compact binary wire formats
//! - [`registry`]: Live connections and their outbound queues
//! - [`broadcast`]: Non-blocking fan-out to every peer
//! - [`session`]: Per-connection control loop
//! - [`server`]: Listener, handshake and out-of-band operations
//! - [`client`]: WebSocket client
//! - [`storage`]: Snapshot files (JSON or LZ4)
//! - [`config`]: Server settings and environment overrides

pub mod broadcast;
pub mod client;
pub mod config;
pub mod grid;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastHub, BroadcastReport, BroadcastStats};
pub use client::{CanvasClient, CanvasEvent, ConnectionState};
pub use config::ServerConfig;
pub use grid::{CellUpdate, Color, Grid, GridError, GridStore, HEIGHT, WIDTH};
pub use protocol::{CanvasMessage, MessageType, ProtocolError, WireFormat};
pub use registry::{Connection, ConnectionId, ConnectionRegistry};
pub use server::{CanvasServer, RawCell, ServerError, ServerStats};
pub use session::{Session, SessionError};
pub use storage::{CanvasStore, FileStore, MemoryStore, StorageFormat, StoreError};
