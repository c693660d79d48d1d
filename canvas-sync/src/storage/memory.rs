//! In-process canvas store for tests and disk-less deployments.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{CanvasStore, StoreError};
use crate::grid::Grid;

/// Keeps the last saved grid in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    grid: Mutex<Option<Grid>>,
    fail_saves: AtomicBool,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail with an I/O error.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

impl CanvasStore for MemoryStore {
    fn load(&self) -> Result<Grid, StoreError> {
        self.grid
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::NotFound)
    }

    fn save(&self, grid: &Grid) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(StoreError::Io(std::io::Error::other("simulated save failure")));
        }
        *self.grid.lock().unwrap_or_else(PoisonError::into_inner) = Some(grid.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
