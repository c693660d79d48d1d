//! Single-file canvas store.
//!
//! Every save writes the full snapshot to `<path>.tmp` and renames it over
//! `<path>`, so a crash mid-write leaves the previous snapshot intact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::snapshot;
use super::{CanvasStore, StorageFormat, StoreError};
use crate::grid::Grid;

/// File-backed [`CanvasStore`].
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    format: StorageFormat,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, format: StorageFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    /// Legacy JSON file at `path`.
    pub fn json(path: impl Into<PathBuf>) -> Self {
        Self::new(path, StorageFormat::Json)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> StorageFormat {
        self.format
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "canvas".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CanvasStore for FileStore {
    fn load(&self) -> Result<Grid, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        match self.format {
            StorageFormat::Json => snapshot::decode_json(&bytes),
            StorageFormat::Compressed => snapshot::decode_compressed(&bytes),
        }
    }

    fn save(&self, grid: &Grid) -> Result<(), StoreError> {
        let bytes = match self.format {
            StorageFormat::Json => snapshot::encode_json(grid)?,
            StorageFormat::Compressed => snapshot::encode_compressed(grid)?,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        log::trace!("Saved canvas to {} ({} bytes)", self.path.display(), bytes.len());
        Ok(())
    }
}
