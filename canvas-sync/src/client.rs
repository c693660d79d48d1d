//! WebSocket client for the canvas server.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Pixel and image sends in either wire format
//! - Decoded inbound events, including the initial snapshot
//!
//! Used by peripheral tools and the integration tests.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::grid::CellUpdate;
use crate::protocol::{decode_cells, CanvasMessage, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasEvent {
    /// Initial snapshot: every non-background cell
    Init(Vec<CellUpdate>),
    /// A peer painted one cell
    Pixel(CellUpdate),
    /// A peer replaced the whole image
    Image(Vec<CellUpdate>),
    /// The canvas was reset
    Reset,
    /// A frame that could not be decoded
    Invalid(ProtocolError),
    /// Connection lost
    Disconnected,
}

/// Decode one inbound frame. The first binary frame after connecting is the
/// snapshot, which may be shorter than a pixel record, so it is decoded as
/// a count-prefixed list regardless of length.
fn decode_event(msg: &Message, awaiting_init: bool) -> Option<Result<CanvasEvent, ProtocolError>> {
    let decoded = match msg {
        Message::Text(text) => CanvasMessage::decode_text(text.as_str()),
        Message::Binary(bytes) if awaiting_init => decode_cells(bytes).map(CanvasMessage::Init),
        Message::Binary(bytes) => CanvasMessage::decode_binary(bytes),
        _ => return None,
    };
    Some(decoded.map(|m| match m {
        CanvasMessage::Init(cells) => CanvasEvent::Init(cells),
        CanvasMessage::PixelUpdate(cell) => CanvasEvent::Pixel(cell),
        CanvasMessage::ImageUpdate(cells) => CanvasEvent::Image(cells),
        CanvasMessage::Reset => CanvasEvent::Reset,
    }))
}

/// The canvas client.
pub struct CanvasClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Message>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<CanvasEvent>>,

    /// Server URL
    server_url: String,
}

impl CanvasClient {
    /// Connect to `server_url` (e.g. `ws://127.0.0.1:8000/api/ws/canvas`).
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(server_url: impl Into<String>) -> Result<Self, ProtocolError> {
        let server_url = server_url.into();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (ws_stream, _) = tokio_tungstenite::connect_async(server_url.as_str())
            .await
            .map_err(|e| {
                log::debug!("Connect to {server_url} failed: {e}");
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: decode incoming frames into events
        let (event_tx, event_rx) = mpsc::channel(1024);
        let reader_state = state.clone();
        tokio::spawn(async move {
            let mut awaiting_init = true;
            while let Some(msg) = ws_reader.next().await {
                let msg = match msg {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(msg) => msg,
                };
                let event = match decode_event(&msg, awaiting_init) {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => CanvasEvent::Invalid(e),
                    None => continue,
                };
                if matches!(event, CanvasEvent::Init(_)) {
                    awaiting_init = false;
                }
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }

            // Connection lost
            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(CanvasEvent::Disconnected).await;
        });

        *state.write().await = ConnectionState::Connected;
        Ok(Self {
            state,
            outgoing_tx: out_tx,
            event_rx: Some(event_rx),
            server_url,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CanvasEvent>> {
        self.event_rx.take()
    }

    /// Send any frame as-is.
    pub async fn send_raw(&self, msg: Message) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(msg)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Paint one cell using the JSON protocol.
    pub async fn send_pixel_text(&self, cell: CellUpdate) -> Result<(), ProtocolError> {
        let text = CanvasMessage::PixelUpdate(cell).encode_text()?;
        self.send_raw(Message::text(text)).await
    }

    /// Paint one cell using the 5-byte binary record.
    pub async fn send_pixel_binary(&self, cell: CellUpdate) -> Result<(), ProtocolError> {
        let bytes = CanvasMessage::PixelUpdate(cell).encode_binary()?;
        self.send_raw(Message::binary(bytes)).await
    }

    /// Replace the whole image using the JSON protocol.
    pub async fn send_image_text(&self, cells: Vec<CellUpdate>) -> Result<(), ProtocolError> {
        let text = CanvasMessage::ImageUpdate(cells).encode_text()?;
        self.send_raw(Message::text(text)).await
    }

    /// Replace the whole image using the count-prefixed binary layout.
    pub async fn send_image_binary(&self, cells: Vec<CellUpdate>) -> Result<(), ProtocolError> {
        let bytes = CanvasMessage::ImageUpdate(cells).encode_binary()?;
        self.send_raw(Message::binary(bytes)).await
    }

    /// Start a clean close handshake.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.send_raw(Message::Close(None)).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Color;
    use crate::protocol::encode_cells;

    #[test]
    fn test_binary_init_may_be_short() {
        // Empty snapshot is just the count prefix
        let empty = Message::binary(encode_cells(&[]).unwrap());
        assert_eq!(
            decode_event(&empty, true),
            Some(Ok(CanvasEvent::Init(vec![])))
        );
        // The same bytes after init are an invalid pixel/image frame
        assert_eq!(
            decode_event(&empty, false),
            Some(Err(ProtocolError::InvalidLength(2)))
        );
    }

    #[test]
    fn test_decode_event_text() {
        let cell = CellUpdate::new(1, 2, Color::new(3, 4, 5));
        let msg = Message::text(CanvasMessage::PixelUpdate(cell).encode_text().unwrap());
        assert_eq!(decode_event(&msg, true), Some(Ok(CanvasEvent::Pixel(cell))));

        let reset = Message::text(r#"{"type":"reset"}"#);
        assert_eq!(decode_event(&reset, false), Some(Ok(CanvasEvent::Reset)));
    }

    #[test]
    fn test_decode_event_binary_after_init() {
        let cell = CellUpdate::new(7, 8, Color::new(1, 1, 1));
        let pixel = Message::binary(vec![7, 8, 1, 1, 1]);
        assert_eq!(decode_event(&pixel, false), Some(Ok(CanvasEvent::Pixel(cell))));

        let image = Message::binary(encode_cells(&[cell]).unwrap());
        assert_eq!(decode_event(&image, false), Some(Ok(CanvasEvent::Image(vec![cell]))));
    }

    #[test]
    fn test_control_frames_are_skipped() {
        assert_eq!(decode_event(&Message::Ping(Vec::new().into()), false), None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = CanvasClient::connect(format!("ws://127.0.0.1:{port}/api/ws/canvas")).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
