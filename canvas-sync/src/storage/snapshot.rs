//! Grid snapshot encodings.
//!
//! - JSON: row-major nested arrays, `[[[r, g, b], ...64], ...64]`. This is
//!   the layout older deployments left behind in `canvas_state.json`.
//! - Compressed: bincode-encoded [`CompressedSnapshot`], LZ4 block
//!   compressed with the uncompressed size prepended. A mostly blank
//!   canvas shrinks from ~12KB of raw cells to a few hundred bytes.

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::grid::{Color, Grid, HEIGHT, WIDTH};

/// Compressed snapshot body. Dimensions are stored so a snapshot taken
/// from a differently sized canvas is rejected instead of misread.
#[derive(Debug, Serialize, Deserialize)]
struct CompressedSnapshot {
    width: u16,
    height: u16,
    cells: Vec<[u8; 3]>,
}

fn triple(c: &Color) -> [u8; 3] {
    [c.r, c.g, c.b]
}

fn color([r, g, b]: [u8; 3]) -> Color {
    Color::new(r, g, b)
}

pub fn encode_json(grid: &Grid) -> Result<Vec<u8>, StoreError> {
    let rows: Vec<Vec<[u8; 3]>> = grid
        .rows()
        .map(|row| row.iter().map(triple).collect())
        .collect();
    serde_json::to_vec(&rows).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn decode_json(bytes: &[u8]) -> Result<Grid, StoreError> {
    let rows: Vec<Vec<[u8; 3]>> =
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    if rows.len() != HEIGHT {
        return Err(StoreError::ShapeMismatch(format!(
            "expected {HEIGHT} rows, found {}",
            rows.len()
        )));
    }
    if let Some((y, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != WIDTH) {
        return Err(StoreError::ShapeMismatch(format!(
            "row {y} has {} cells, expected {WIDTH}",
            row.len()
        )));
    }

    let cells = rows.into_iter().flatten().map(color).collect();
    Grid::from_row_major(cells)
        .ok_or_else(|| StoreError::ShapeMismatch("cell count mismatch".to_string()))
}

pub fn encode_compressed(grid: &Grid) -> Result<Vec<u8>, StoreError> {
    let snapshot = CompressedSnapshot {
        width: WIDTH as u16,
        height: HEIGHT as u16,
        cells: grid.cells().iter().map(triple).collect(),
    };
    let raw = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub fn decode_compressed(bytes: &[u8]) -> Result<Grid, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let (snapshot, _): (CompressedSnapshot, usize) =
        bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

    if snapshot.width as usize != WIDTH || snapshot.height as usize != HEIGHT {
        return Err(StoreError::ShapeMismatch(format!(
            "snapshot is {}x{}, canvas is {WIDTH}x{HEIGHT}",
            snapshot.width, snapshot.height
        )));
    }
    let cells = snapshot.cells.into_iter().map(color).collect();
    Grid::from_row_major(cells)
        .ok_or_else(|| StoreError::ShapeMismatch("cell count mismatch".to_string()))
}
