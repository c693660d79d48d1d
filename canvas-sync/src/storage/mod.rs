//! Durable storage for the canvas.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   save(&Grid)   ┌──────────────────────────────┐
//! │ GridStore   │ ──────────────► │ CanvasStore                  │
//! │ (in-memory) │                 │  FileStore   - JSON or LZ4   │
//! └──────┬──────┘                 │  MemoryStore - tests/no-disk │
//!        │ on startup: load()     └──────────────────────────────┘
//!        ▼
//! ┌─────────────┐
//! │ Grid        │
//! │ (restored)  │
//! └─────────────┘
//! ```
//!
//! The store only ever sees whole grids. Writes are best-effort from the
//! grid's point of view: a failed save is logged by the caller and the
//! in-memory state stays authoritative.

pub mod file;
pub mod memory;
pub mod snapshot;

use std::str::FromStr;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::grid::Grid;

/// Persistence backend for the authoritative grid.
pub trait CanvasStore: Send + Sync {
    /// Load the last saved grid. `StoreError::NotFound` when nothing was
    /// ever saved.
    fn load(&self) -> Result<Grid, StoreError>;

    /// Persist a full grid, replacing whatever was stored before.
    fn save(&self, grid: &Grid) -> Result<(), StoreError>;
}

/// On-disk snapshot encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageFormat {
    /// Legacy `canvas_state.json`: 64 rows of 64 `[r, g, b]` triples.
    #[default]
    Json,
    /// bincode cell array, LZ4 compressed with a size prefix.
    Compressed,
}

impl FromStr for StorageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compressed" | "lz4" => Ok(Self::Compressed),
            other => Err(format!("unknown storage format '{other}'")),
        }
    }
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nothing has been persisted yet
    #[error("no persisted canvas")]
    NotFound,
    /// Underlying filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data exists but cannot be decoded
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
    /// Data decodes but is not a 64x64 grid
    #[error("snapshot shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Encoding the grid failed
    #[error("serialization error: {0}")]
    Serialization(String),
}
