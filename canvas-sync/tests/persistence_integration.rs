//! Persistence integration tests.
//!
//! Verifies:
//! - Canvas survives a server restart (JSON and LZ4 snapshots)
//! - Legacy JSON layout on disk
//! - Corrupt or wrongly shaped snapshots fall back to a blank canvas
//! - Failed saves never roll back the in-memory canvas

use canvas_sync::client::{CanvasClient, CanvasEvent};
use canvas_sync::config::ServerConfig;
use canvas_sync::grid::{CellUpdate, Color, HEIGHT, WIDTH};
use canvas_sync::server::CanvasServer;
use canvas_sync::storage::{CanvasStore, FileStore, MemoryStore, StorageFormat};

use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn file_config(path: &Path, format: StorageFormat) -> ServerConfig {
    ServerConfig {
        storage_path: Some(path.to_path_buf()),
        storage_format: format,
        ..ServerConfig::for_testing("127.0.0.1:0")
    }
}

async fn serve(server: Arc<CanvasServer>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let url = format!("ws://127.0.0.1:{port}{}", server.config().endpoint_path);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    url
}

// ─── Restart Roundtrip ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_json_canvas_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas_state.json");

    {
        let server = CanvasServer::new(file_config(&path, StorageFormat::Json));
        server.grid().set_cell(10, 20, Color::new(1, 2, 3)).await.unwrap();
        server.grid().set_cell(63, 63, Color::new(255, 255, 255)).await.unwrap();
    }

    let restarted = CanvasServer::new(file_config(&path, StorageFormat::Json));
    let grid = restarted.grid().snapshot();
    assert_eq!(grid.get(10, 20), Some(Color::new(1, 2, 3)));
    assert_eq!(grid.get(63, 63), Some(Color::new(255, 255, 255)));
    assert_eq!(grid.non_background().len(), 2);
}

#[tokio::test]
async fn test_compressed_canvas_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas.lz4");

    {
        let server = CanvasServer::new(file_config(&path, StorageFormat::Compressed));
        let image: Vec<CellUpdate> = (0..64u8)
            .map(|i| CellUpdate::new(i, i, Color::new(i, 0, 255 - i)))
            .collect();
        assert_eq!(server.grid().replace_all(&image).await, 64);
    }

    let restarted = CanvasServer::new(file_config(&path, StorageFormat::Compressed));
    let grid = restarted.grid().snapshot();
    assert_eq!(grid.non_background().len(), 64);
    assert_eq!(grid.get(32, 32), Some(Color::new(32, 0, 223)));
}

#[tokio::test]
async fn test_reset_is_persisted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas_state.json");

    {
        let server = CanvasServer::new(file_config(&path, StorageFormat::Json));
        server.grid().set_cell(1, 1, Color::new(9, 9, 9)).await.unwrap();
        server.reset().await;
    }

    let restarted = CanvasServer::new(file_config(&path, StorageFormat::Json));
    assert!(restarted.grid().snapshot().is_blank());
}

// ─── On-Disk Layout ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_json_snapshot_layout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas_state.json");

    let server = CanvasServer::new(file_config(&path, StorageFormat::Json));
    server.grid().set_cell(5, 7, Color::new(10, 20, 30)).await.unwrap();

    let rows: Vec<Vec<[u8; 3]>> =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(rows.len(), HEIGHT);
    assert!(rows.iter().all(|row| row.len() == WIDTH));
    // Outer index is the row (y)
    assert_eq!(rows[7][5], [10, 20, 30]);
    assert_eq!(rows[5][7], [0, 0, 0]);
}

// ─── Fallback On Bad Data ────────────────────────────────────────────────────

#[tokio::test]
async fn test_corrupt_snapshot_starts_blank() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas_state.json");
    std::fs::write(&path, b"{ this is not a canvas").unwrap();

    let server = CanvasServer::new(file_config(&path, StorageFormat::Json));
    assert!(server.grid().snapshot().is_blank());

    // The next mutation overwrites the corrupt file
    server.grid().set_cell(0, 0, Color::new(1, 1, 1)).await.unwrap();
    let reloaded = FileStore::json(&path).load().unwrap();
    assert_eq!(reloaded.get(0, 0), Some(Color::new(1, 1, 1)));
}

#[tokio::test]
async fn test_wrong_shape_snapshot_starts_blank() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas_state.json");
    let small = vec![vec![[255u8, 255, 255]; 2]; 2];
    std::fs::write(&path, serde_json::to_vec(&small).unwrap()).unwrap();

    let server = CanvasServer::new(file_config(&path, StorageFormat::Json));
    assert!(server.grid().snapshot().is_blank());
}

#[tokio::test]
async fn test_missing_directory_is_created_on_save() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("state").join("canvas.json");

    let server = CanvasServer::new(file_config(&path, StorageFormat::Json));
    assert!(server.grid().snapshot().is_blank());
    server.grid().set_cell(2, 2, Color::new(2, 2, 2)).await.unwrap();

    assert!(path.exists());
    assert_eq!(server.stats().persist_failures, 0);
}

// ─── Save Failures ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_save_keeps_memory_state() {
    let store = Arc::new(MemoryStore::new());
    store.fail_saves(true);
    let server = CanvasServer::with_store(ServerConfig::for_testing("127.0.0.1:0"), store.clone());

    server.grid().set_cell(3, 3, Color::new(7, 7, 7)).await.unwrap();
    server.reset().await;
    server.grid().set_cell(4, 4, Color::new(8, 8, 8)).await.unwrap();

    assert_eq!(server.stats().persist_failures, 3);
    assert_eq!(store.save_count(), 0);
    assert_eq!(
        server.grid().snapshot().non_background(),
        vec![CellUpdate::new(4, 4, Color::new(8, 8, 8))]
    );

    // Recovers once the store does
    store.fail_saves(false);
    server.grid().set_cell(5, 5, Color::new(9, 9, 9)).await.unwrap();
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.load().unwrap().non_background().len(), 2);
}

// ─── Through The Network ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_update_is_persisted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("canvas_state.json");
    let server = Arc::new(CanvasServer::new(file_config(&path, StorageFormat::Json)));
    let url = serve(server.clone()).await;

    let mut writer = CanvasClient::connect(url.as_str()).await.unwrap();
    let mut watcher = CanvasClient::connect(url.as_str()).await.unwrap();
    let mut writer_events = writer.take_event_rx().unwrap();
    let mut watcher_events = watcher.take_event_rx().unwrap();
    for events in [&mut writer_events, &mut watcher_events] {
        let init = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(init, Some(CanvasEvent::Init(vec![])));
    }

    let cell = CellUpdate::new(12, 34, Color::new(200, 100, 50));
    writer.send_pixel_binary(cell).await.unwrap();

    let event = timeout(Duration::from_secs(2), watcher_events.recv()).await.unwrap();
    assert_eq!(event, Some(CanvasEvent::Pixel(cell)));

    // The save follows the broadcast under the same commit
    let store = FileStore::json(&path);
    for _ in 0..200 {
        if store.load().is_ok_and(|g| g.non_background() == vec![cell]) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pixel was not persisted within 2s");
}
