//! Authoritative canvas state.
//!
//! Architecture:
//! ```text
//!   set_cell / replace_all / reset
//!               │
//!               ▼
//!   ┌─────────────────────┐   save(&Grid)   ┌─────────────┐
//!   │ GridStore           │ ──────────────► │ CanvasStore │
//!   │ RwLock<Arc<Grid>>   │                 │ (file/mem)  │
//!   └──────────┬──────────┘                 └─────────────┘
//!              │ snapshot(): Arc clone, never blocks on I/O
//!              ▼
//!           readers
//! ```
//!
//! Readers hold an immutable `Arc<Grid>`. Single-cell writes go through
//! `Arc::make_mut` (copy-on-write when a reader still holds the old grid),
//! bulk writes build a fresh grid and swap the pointer. Either way a reader
//! sees the whole grid before or after a mutation, never a mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::storage::{CanvasStore, MemoryStore, StoreError};

/// Canvas width in cells.
pub const WIDTH: usize = 64;
/// Canvas height in cells.
pub const HEIGHT: usize = 64;
/// Total number of cells on the canvas.
pub const CELL_COUNT: usize = WIDTH * HEIGHT;

/// RGB color of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Default cell color, used for reset and for unlisted cells.
    pub const BACKGROUND: Color = Color { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn is_background(&self) -> bool {
        *self == Self::BACKGROUND
    }

    /// Build a color from unchecked integers (JSON input, HTTP bodies).
    pub fn try_from_raw(r: i64, g: i64, b: i64) -> Result<Self, GridError> {
        Ok(Self {
            r: channel(r)?,
            g: channel(g)?,
            b: channel(b)?,
        })
    }
}

fn channel(value: i64) -> Result<u8, GridError> {
    u8::try_from(value).map_err(|_| GridError::ChannelOutOfRange(value))
}

/// A single `{x, y, color}` mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellUpdate {
    pub x: u8,
    pub y: u8,
    pub color: Color,
}

impl CellUpdate {
    pub const fn new(x: u8, y: u8, color: Color) -> Self {
        Self { x, y, color }
    }

    /// Validate raw integers against the canvas and channel domains.
    pub fn try_from_raw(x: i64, y: i64, r: i64, g: i64, b: i64) -> Result<Self, GridError> {
        if !(0..WIDTH as i64).contains(&x) || !(0..HEIGHT as i64).contains(&y) {
            return Err(GridError::OutOfRange { x, y });
        }
        Ok(Self {
            x: x as u8,
            y: y as u8,
            color: Color::try_from_raw(r, g, b)?,
        })
    }

    /// Whether the coordinates address a cell on the canvas.
    pub fn in_bounds(&self) -> bool {
        (self.x as usize) < WIDTH && (self.y as usize) < HEIGHT
    }
}

/// Errors from grid mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("cell ({x}, {y}) is outside the 64x64 canvas")]
    OutOfRange { x: i64, y: i64 },
    #[error("color channel value {0} is outside 0..=255")]
    ChannelOutOfRange(i64),
}

/// Fixed-size 64×64 color matrix, row-major by `y`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    cells: Vec<Color>,
}

impl Default for Grid {
    fn default() -> Self {
        Self::new()
    }
}

impl Grid {
    /// All-background grid.
    pub fn new() -> Self {
        Self {
            cells: vec![Color::BACKGROUND; CELL_COUNT],
        }
    }

    /// Build from a row-major cell vector. Returns `None` unless the
    /// vector holds exactly `CELL_COUNT` cells.
    pub fn from_row_major(cells: Vec<Color>) -> Option<Self> {
        (cells.len() == CELL_COUNT).then_some(Self { cells })
    }

    pub fn get(&self, x: usize, y: usize) -> Option<Color> {
        if x < WIDTH && y < HEIGHT {
            Some(self.cells[y * WIDTH + x])
        } else {
            None
        }
    }

    pub fn set(&mut self, x: usize, y: usize, color: Color) -> Result<(), GridError> {
        if x >= WIDTH || y >= HEIGHT {
            return Err(GridError::OutOfRange {
                x: x as i64,
                y: y as i64,
            });
        }
        self.cells[y * WIDTH + x] = color;
        Ok(())
    }

    pub fn cells(&self) -> &[Color] {
        &self.cells
    }

    /// Iterate rows top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[Color]> {
        self.cells.chunks(WIDTH)
    }

    /// Every non-background cell, row by row.
    pub fn non_background(&self) -> Vec<CellUpdate> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_background())
            .map(|(i, c)| CellUpdate::new((i % WIDTH) as u8, (i / WIDTH) as u8, *c))
            .collect()
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(Color::is_background)
    }
}

/// Owner of the authoritative grid.
///
/// Mutations are serialized by `write_lock` so that persisted snapshots
/// land in commit order; the grid pointer itself is only locked for the
/// in-memory update, never across storage I/O.
pub struct GridStore {
    grid: RwLock<Arc<Grid>>,
    store: Arc<dyn CanvasStore>,
    write_lock: Mutex<()>,
    persist_failures: AtomicU64,
}

impl GridStore {
    /// Open the grid, loading the last persisted state once.
    ///
    /// Missing, corrupt or wrongly shaped data falls back to an
    /// all-background grid.
    pub fn open(store: Arc<dyn CanvasStore>) -> Self {
        let grid = match store.load() {
            Ok(grid) => {
                log::info!(
                    "Loaded canvas from storage ({} painted cells)",
                    grid.non_background().len()
                );
                grid
            }
            Err(StoreError::NotFound) => {
                log::info!("No persisted canvas found, starting blank");
                Grid::new()
            }
            Err(e) => {
                log::warn!("Ignoring persisted canvas: {e}");
                Grid::new()
            }
        };
        Self {
            grid: RwLock::new(Arc::new(grid)),
            store,
            write_lock: Mutex::new(()),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Blank grid backed by a throwaway in-memory store.
    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryStore::new()))
    }

    /// Immutable view of the current grid.
    pub fn snapshot(&self) -> Arc<Grid> {
        self.grid
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Paint one cell. The grid is untouched when `x`/`y` are off-canvas.
    pub async fn set_cell(&self, x: usize, y: usize, color: Color) -> Result<(), GridError> {
        self.set_cell_with(x, y, color, || ()).await
    }

    /// Paint one cell and run `on_commit` before any later mutation can
    /// commit. Whatever `on_commit` publishes is therefore ordered exactly
    /// like the commits, so the last value a peer sees is the grid's.
    ///
    /// `on_commit` runs under the write lock and must not block.
    pub async fn set_cell_with<R>(
        &self,
        x: usize,
        y: usize,
        color: Color,
        on_commit: impl FnOnce() -> R,
    ) -> Result<R, GridError> {
        if x >= WIDTH || y >= HEIGHT {
            return Err(GridError::OutOfRange {
                x: x as i64,
                y: y as i64,
            });
        }

        let _serial = self.write_lock.lock().await;
        let committed = {
            let mut guard = self.grid.write().unwrap_or_else(PoisonError::into_inner);
            Arc::make_mut(&mut *guard).set(x, y, color)?;
            Arc::clone(&*guard)
        };
        let out = on_commit();
        self.persist(committed).await;
        Ok(out)
    }

    /// Paint one cell from a decoded update.
    pub async fn apply(&self, cell: CellUpdate) -> Result<(), GridError> {
        self.set_cell(cell.x as usize, cell.y as usize, cell.color).await
    }

    /// [`apply`](Self::apply) with a commit hook, see [`set_cell_with`](Self::set_cell_with).
    pub async fn apply_with<R>(
        &self,
        cell: CellUpdate,
        on_commit: impl FnOnce() -> R,
    ) -> Result<R, GridError> {
        self.set_cell_with(cell.x as usize, cell.y as usize, cell.color, on_commit)
            .await
    }

    /// Replace the whole grid: start from background, apply every in-bounds
    /// cell in order, swap atomically. Off-canvas cells are skipped.
    ///
    /// Returns the number of cells applied.
    pub async fn replace_all(&self, cells: &[CellUpdate]) -> usize {
        self.replace_all_with(cells, || ()).await.0
    }

    /// [`replace_all`](Self::replace_all) with a commit hook.
    pub async fn replace_all_with<R>(
        &self,
        cells: &[CellUpdate],
        on_commit: impl FnOnce() -> R,
    ) -> (usize, R) {
        let mut next = Grid::new();
        let mut applied = 0;
        for cell in cells.iter().filter(|c| c.in_bounds()) {
            next.cells[cell.y as usize * WIDTH + cell.x as usize] = cell.color;
            applied += 1;
        }
        if applied < cells.len() {
            log::debug!("replace_all skipped {} off-canvas cells", cells.len() - applied);
        }

        let out = self.swap(next, on_commit).await;
        (applied, out)
    }

    /// Set every cell to background.
    pub async fn reset(&self) {
        self.reset_with(|| ()).await
    }

    /// [`reset`](Self::reset) with a commit hook.
    pub async fn reset_with<R>(&self, on_commit: impl FnOnce() -> R) -> R {
        self.swap(Grid::new(), on_commit).await
    }

    async fn swap<R>(&self, next: Grid, on_commit: impl FnOnce() -> R) -> R {
        let next = Arc::new(next);
        let _serial = self.write_lock.lock().await;
        {
            let mut guard = self.grid.write().unwrap_or_else(PoisonError::into_inner);
            *guard = next.clone();
        }
        let out = on_commit();
        self.persist(next).await;
        out
    }

    /// Best-effort save off the runtime threads; the in-memory grid stays
    /// authoritative on failure. Called with `write_lock` held so saves
    /// land in commit order.
    async fn persist(&self, grid: Arc<Grid>) {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&grid)).await;
        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("save task failed: {e}"),
        };
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
        log::error!("Failed to persist canvas: {err}");
    }

    /// Number of saves that failed since startup.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }
}
