//! Canvas wire protocol: legacy JSON text frames and compact binary frames.
//!
//! Text (self-describing, `type` discriminator):
//! ```text
//! {"type":"init","canvas":[{"x":0,"y":0,"r":255,"g":0,"b":0}, ...]}
//! {"type":"pixel_update","x":10,"y":10,"r":255,"g":0,"b":0}
//! {"type":"image_update","canvas":[...]}
//! {"type":"reset"}
//! ```
//!
//! Binary (positional, little-endian count):
//! ```text
//! single cell        ┌────┬────┬────┬────┬────┐
//! (exactly 5 bytes)  │ x  │ y  │ r  │ g  │ b  │
//!                    └────┴────┴────┴────┴────┘
//! image / snapshot   ┌──────────┬──────────────────────────┐
//! (2 + 5·count)      │ count u16│ count × (x, y, r, g, b)  │
//!                    └──────────┴──────────────────────────┘
//! ```
//!
//! Inbound binary frames are told apart by length alone: 5 bytes is a
//! single cell, anything longer is an image update, 0..=4 is invalid.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::grid::{CellUpdate, Color, GridError};

/// Bytes in one binary cell record.
pub const RECORD_LEN: usize = 5;
/// Bytes in the little-endian cell count prefix.
pub const COUNT_PREFIX_LEN: usize = 2;

/// Logical message kinds shared by both encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Server → client, once per connection: all non-background cells
    Init,
    /// One cell, either direction
    PixelUpdate,
    /// Full replacement image, either direction
    ImageUpdate,
    /// Server → client: every cell back to background
    Reset,
}

/// Decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasMessage {
    Init(Vec<CellUpdate>),
    PixelUpdate(CellUpdate),
    ImageUpdate(Vec<CellUpdate>),
    Reset,
}

/// Which encoding a frame uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Text,
    Binary,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "json" => Ok(Self::Text),
            "binary" => Ok(Self::Binary),
            other => Err(format!("unknown wire format '{other}'")),
        }
    }
}

/// Classification of an inbound binary frame by its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Pixel,
    Image,
}

impl BinaryKind {
    /// `None` for frames too short to mean anything.
    pub fn classify(len: usize) -> Option<Self> {
        match len {
            RECORD_LEN => Some(Self::Pixel),
            n if n > RECORD_LEN => Some(Self::Image),
            _ => None,
        }
    }
}

/// Cell as it appears in JSON. Wide integers so that out-of-domain values
/// reach validation instead of failing as opaque type errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TextCell {
    x: i64,
    y: i64,
    r: i64,
    g: i64,
    b: i64,
}

impl From<&CellUpdate> for TextCell {
    fn from(c: &CellUpdate) -> Self {
        Self {
            x: c.x.into(),
            y: c.y.into(),
            r: c.color.r.into(),
            g: c.color.g.into(),
            b: c.color.b.into(),
        }
    }
}

impl TryFrom<TextCell> for CellUpdate {
    type Error = ProtocolError;

    fn try_from(c: TextCell) -> Result<Self, Self::Error> {
        CellUpdate::try_from_raw(c.x, c.y, c.r, c.g, c.b).map_err(ProtocolError::from)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TextEnvelope {
    Init { canvas: Vec<TextCell> },
    PixelUpdate(TextCell),
    ImageUpdate { canvas: Vec<TextCell> },
    Reset,
}

fn text_cells(cells: &[CellUpdate]) -> Vec<TextCell> {
    cells.iter().map(TextCell::from).collect()
}

fn validate_cells(cells: Vec<TextCell>) -> Result<Vec<CellUpdate>, ProtocolError> {
    cells.into_iter().map(CellUpdate::try_from).collect()
}

impl CanvasMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Init(_) => MessageType::Init,
            Self::PixelUpdate(_) => MessageType::PixelUpdate,
            Self::ImageUpdate(_) => MessageType::ImageUpdate,
            Self::Reset => MessageType::Reset,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode_text(&self) -> Result<String, ProtocolError> {
        let envelope = match self {
            Self::Init(cells) => TextEnvelope::Init {
                canvas: text_cells(cells),
            },
            Self::PixelUpdate(cell) => TextEnvelope::PixelUpdate(cell.into()),
            Self::ImageUpdate(cells) => TextEnvelope::ImageUpdate {
                canvas: text_cells(cells),
            },
            Self::Reset => TextEnvelope::Reset,
        };
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse and validate a JSON text frame. Missing fields, wrong types,
    /// unknown `type` values and off-canvas cells are all rejected.
    pub fn decode_text(text: &str) -> Result<Self, ProtocolError> {
        let envelope: TextEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedText(e.to_string()))?;
        Ok(match envelope {
            TextEnvelope::Init { canvas } => Self::Init(validate_cells(canvas)?),
            TextEnvelope::PixelUpdate(cell) => Self::PixelUpdate(cell.try_into()?),
            TextEnvelope::ImageUpdate { canvas } => Self::ImageUpdate(validate_cells(canvas)?),
            TextEnvelope::Reset => Self::Reset,
        })
    }

    /// Serialize to a binary frame. `Reset` has no binary form.
    pub fn encode_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::PixelUpdate(cell) => Ok(encode_record(cell).to_vec()),
            Self::Init(cells) | Self::ImageUpdate(cells) => encode_cells(cells),
            Self::Reset => Err(ProtocolError::NoBinaryForm(MessageType::Reset)),
        }
    }

    /// Decode an inbound binary frame, dispatching on length.
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match BinaryKind::classify(bytes.len()) {
            Some(BinaryKind::Pixel) => Ok(Self::PixelUpdate(decode_record(bytes)?)),
            Some(BinaryKind::Image) => Ok(Self::ImageUpdate(decode_cells(bytes)?)),
            None => Err(ProtocolError::InvalidLength(bytes.len())),
        }
    }

    /// Encode in the requested format.
    pub fn encode(&self, format: WireFormat) -> Result<WireFrame, ProtocolError> {
        match format {
            WireFormat::Text => self.encode_text().map(WireFrame::Text),
            WireFormat::Binary => self.encode_binary().map(WireFrame::Binary),
        }
    }
}

/// An encoded frame ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Encode one cell as a 5-byte record.
pub fn encode_record(cell: &CellUpdate) -> [u8; RECORD_LEN] {
    [cell.x, cell.y, cell.color.r, cell.color.g, cell.color.b]
}

/// Decode one 5-byte record, rejecting off-canvas coordinates.
pub fn decode_record(bytes: &[u8]) -> Result<CellUpdate, ProtocolError> {
    let [x, y, r, g, b]: [u8; RECORD_LEN] = bytes
        .try_into()
        .map_err(|_| ProtocolError::Truncated {
            needed: RECORD_LEN,
            got: bytes.len(),
        })?;
    let cell = CellUpdate::new(x, y, Color::new(r, g, b));
    if !cell.in_bounds() {
        return Err(ProtocolError::OutOfRange(GridError::OutOfRange {
            x: x.into(),
            y: y.into(),
        }));
    }
    Ok(cell)
}

/// Encode a count-prefixed cell list (snapshot or image update).
pub fn encode_cells(cells: &[CellUpdate]) -> Result<Vec<u8>, ProtocolError> {
    let count = u16::try_from(cells.len()).map_err(|_| ProtocolError::TooManyCells(cells.len()))?;
    let mut out = Vec::with_capacity(COUNT_PREFIX_LEN + cells.len() * RECORD_LEN);
    out.extend_from_slice(&count.to_le_bytes());
    for cell in cells {
        out.extend_from_slice(&encode_record(cell));
    }
    Ok(out)
}

/// Decode a count-prefixed cell list. The body must hold exactly
/// `count` records.
pub fn decode_cells(bytes: &[u8]) -> Result<Vec<CellUpdate>, ProtocolError> {
    let Some((prefix, body)) = bytes.split_first_chunk::<COUNT_PREFIX_LEN>() else {
        return Err(ProtocolError::Truncated {
            needed: COUNT_PREFIX_LEN,
            got: bytes.len(),
        });
    };
    let declared = u16::from_le_bytes(*prefix) as usize;
    if body.len() != declared * RECORD_LEN {
        return Err(ProtocolError::CountMismatch {
            declared,
            body_len: body.len(),
        });
    }
    body.chunks_exact(RECORD_LEN).map(decode_record).collect()
}

/// Protocol errors. Everything except `ConnectionClosed` describes a single
/// bad frame; the session drops it and keeps going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    MalformedText(String),
    InvalidLength(usize),
    Truncated { needed: usize, got: usize },
    CountMismatch { declared: usize, body_len: usize },
    TooManyCells(usize),
    OutOfRange(GridError),
    NoBinaryForm(MessageType),
    ConnectionClosed,
}

impl From<GridError> for ProtocolError {
    fn from(e: GridError) -> Self {
        Self::OutOfRange(e)
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::MalformedText(e) => write!(f, "Malformed text frame: {e}"),
            Self::InvalidLength(n) => write!(f, "Binary frame of {n} bytes is too short"),
            Self::Truncated { needed, got } => {
                write!(f, "Truncated frame: needed {needed} bytes, got {got}")
            }
            Self::CountMismatch { declared, body_len } => write!(
                f,
                "Count mismatch: {declared} cells declared, {body_len} body bytes"
            ),
            Self::TooManyCells(n) => write!(f, "{n} cells do not fit a u16 count"),
            Self::OutOfRange(e) => write!(f, "Out of range: {e}"),
            Self::NoBinaryForm(t) => write!(f, "{t:?} has no binary encoding"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(x: u8, y: u8, r: u8, g: u8, b: u8) -> CellUpdate {
        CellUpdate::new(x, y, Color::new(r, g, b))
    }

    #[test]
    fn test_pixel_update_text_shape() {
        let msg = CanvasMessage::PixelUpdate(cell(10, 10, 255, 0, 0));
        let text = msg.encode_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "pixel_update", "x": 10, "y": 10, "r": 255, "g": 0, "b": 0})
        );
        assert_eq!(CanvasMessage::decode_text(&text).unwrap(), msg);
    }

    #[test]
    fn test_init_and_reset_text() {
        let init = CanvasMessage::Init(vec![cell(1, 2, 3, 4, 5)]);
        let text = init.encode_text().unwrap();
        assert!(text.starts_with(r#"{"type":"init","canvas":["#));
        assert_eq!(CanvasMessage::decode_text(&text).unwrap(), init);

        assert_eq!(CanvasMessage::Reset.encode_text().unwrap(), r#"{"type":"reset"}"#);
        assert_eq!(
            CanvasMessage::decode_text(r#"{"type":"reset"}"#).unwrap(),
            CanvasMessage::Reset
        );
    }

    #[test]
    fn test_text_ignores_extra_fields() {
        let msg = CanvasMessage::decode_text(
            r#"{"type":"pixel_update","x":1,"y":2,"r":3,"g":4,"b":5,"client":"esp32"}"#,
        )
        .unwrap();
        assert_eq!(msg, CanvasMessage::PixelUpdate(cell(1, 2, 3, 4, 5)));
    }

    #[test]
    fn test_text_rejects_bad_shapes() {
        let cases = [
            r#"{"type":"pixel_update","x":1,"y":2,"r":3,"g":4}"#,
            r#"{"type":"pixel_update","x":"1","y":2,"r":3,"g":4,"b":5}"#,
            r#"{"type":"pixel_update","x":1.5,"y":2,"r":3,"g":4,"b":5}"#,
            r#"{"type":"paint","x":1,"y":2,"r":3,"g":4,"b":5}"#,
            r#"{"x":1,"y":2,"r":3,"g":4,"b":5}"#,
            r#"{"type":"image_update"}"#,
            "not json",
        ];
        for case in cases {
            assert!(
                matches!(CanvasMessage::decode_text(case), Err(ProtocolError::MalformedText(_))),
                "{case} should be malformed"
            );
        }
    }

    #[test]
    fn test_text_rejects_out_of_range() {
        for case in [
            r#"{"type":"pixel_update","x":64,"y":0,"r":0,"g":0,"b":0}"#,
            r#"{"type":"pixel_update","x":-1,"y":0,"r":0,"g":0,"b":0}"#,
            r#"{"type":"pixel_update","x":0,"y":0,"r":256,"g":0,"b":0}"#,
            r#"{"type":"image_update","canvas":[{"x":0,"y":99,"r":0,"g":0,"b":0}]}"#,
        ] {
            assert!(
                matches!(CanvasMessage::decode_text(case), Err(ProtocolError::OutOfRange(_))),
                "{case} should be out of range"
            );
        }
    }

    #[test]
    fn test_binary_snapshot_two_cells() {
        let cells = vec![cell(0, 0, 255, 0, 0), cell(63, 63, 0, 255, 0)];
        let bytes = encode_cells(&cells).unwrap();
        assert_eq!(bytes, vec![2, 0, 0, 0, 255, 0, 0, 63, 63, 0, 255, 0]);
        assert_eq!(decode_cells(&bytes).unwrap(), cells);
    }

    #[test]
    fn test_binary_empty_and_full_snapshot() {
        assert_eq!(decode_cells(&encode_cells(&[]).unwrap()).unwrap(), vec![]);

        let full: Vec<CellUpdate> = (0..64u8)
            .flat_map(|y| (0..64u8).map(move |x| cell(x, y, x, y, x ^ y)))
            .collect();
        let bytes = encode_cells(&full).unwrap();
        assert_eq!(bytes.len(), 4096 * 5 + 2);
        assert_eq!(&bytes[..2], &4096u16.to_le_bytes());
        assert_eq!(decode_cells(&bytes).unwrap(), full);
    }

    #[test]
    fn test_length_disambiguation() {
        assert_eq!(BinaryKind::classify(5), Some(BinaryKind::Pixel));
        assert_eq!(BinaryKind::classify(6), Some(BinaryKind::Image));
        assert_eq!(BinaryKind::classify(7), Some(BinaryKind::Image));
        assert_eq!(BinaryKind::classify(4096 * 5 + 2), Some(BinaryKind::Image));
        for n in 0..5 {
            assert_eq!(BinaryKind::classify(n), None);
        }
    }

    #[test]
    fn test_decode_binary_five_bytes_is_pixel() {
        let msg = CanvasMessage::decode_binary(&[10, 10, 255, 0, 0]).unwrap();
        assert_eq!(msg, CanvasMessage::PixelUpdate(cell(10, 10, 255, 0, 0)));
    }

    #[test]
    fn test_decode_binary_six_bytes_fails() {
        let err = CanvasMessage::decode_binary(&[1, 0, 1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, ProtocolError::CountMismatch { declared: 1, body_len: 4 }));
    }

    #[test]
    fn test_decode_binary_seven_bytes_is_image() {
        let one = CanvasMessage::decode_binary(&[1, 0, 3, 4, 9, 9, 9]).unwrap();
        assert_eq!(one, CanvasMessage::ImageUpdate(vec![cell(3, 4, 9, 9, 9)]));

        // count=0 with a leftover record is still an image frame, just a bad one
        let err = CanvasMessage::decode_binary(&[0, 0, 3, 4, 9, 9, 9]).unwrap_err();
        assert!(matches!(err, ProtocolError::CountMismatch { declared: 0, body_len: 5 }));
    }

    #[test]
    fn test_decode_binary_short_frames() {
        for n in 0..5 {
            let bytes = vec![0u8; n];
            assert_eq!(
                CanvasMessage::decode_binary(&bytes),
                Err(ProtocolError::InvalidLength(n))
            );
        }
    }

    #[test]
    fn test_decode_binary_out_of_range() {
        assert!(matches!(
            CanvasMessage::decode_binary(&[64, 0, 0, 0, 0]),
            Err(ProtocolError::OutOfRange(_))
        ));
        assert!(matches!(
            CanvasMessage::decode_binary(&[1, 0, 0, 200, 0, 0, 0]),
            Err(ProtocolError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_decode_cells_truncated_prefix() {
        assert!(matches!(
            decode_cells(&[7]),
            Err(ProtocolError::Truncated { needed: 2, got: 1 })
        ));
    }

    #[test]
    fn test_reset_has_no_binary_form() {
        assert_eq!(
            CanvasMessage::Reset.encode_binary(),
            Err(ProtocolError::NoBinaryForm(MessageType::Reset))
        );
    }

    #[test]
    fn test_binary_size_efficient() {
        let cells: Vec<CellUpdate> = (0..64u8).map(|x| cell(x, 0, 255, 255, 255)).collect();
        let binary = CanvasMessage::ImageUpdate(cells.clone()).encode_binary().unwrap();
        let text = CanvasMessage::ImageUpdate(cells).encode_text().unwrap();
        assert_eq!(binary.len(), 2 + 64 * 5);
        assert!(binary.len() * 5 < text.len(), "binary {} vs text {}", binary.len(), text.len());
    }

    #[test]
    fn test_wire_format_parse() {
        assert_eq!("binary".parse::<WireFormat>().unwrap(), WireFormat::Binary);
        assert_eq!("JSON".parse::<WireFormat>().unwrap(), WireFormat::Text);
        assert!("xml".parse::<WireFormat>().is_err());
    }
}
