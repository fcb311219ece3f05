//! Wire protocol between the agent and the console.
//!
//! Every WebSocket message is a single binary frame:
//!
//! ```text
//! offset 0 : 1 byte   message kind
//! offset 1 : 4 bytes  payload length N, big-endian
//! offset 5 : N bytes  payload
//! ```
//!
//! Payloads are UTF-8 JSON objects, empty (STOP_STREAM, HEARTBEAT_ACK), or,
//! for FRAME only, the binary layout `[4B seq BE][4B ts_ms BE][JPEG]`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed header size: kind byte plus payload length field.
pub const HEADER_LEN: usize = 5;

/// Ceiling on a declared payload length (64 MiB). The protocol requires
/// accepting at least 16 MiB; anything above the ceiling is treated as a
/// framing error rather than an allocation request.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("payload of {0} bytes does not fit the u32 length field")]
    PayloadTooLarge(usize),
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("buffer truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("declared payload length {0} exceeds the decode ceiling")]
    Oversized(u32),
}

/// Message kind byte values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Auth = 0x01,
    AuthOk = 0x02,
    StartStream = 0x03,
    Frame = 0x04,
    MouseEvent = 0x05,
    KeyEvent = 0x06,
    StopStream = 0x07,
    Heartbeat = 0x08,
    HeartbeatAck = 0x09,
    Error = 0xFF,
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(MessageKind::Auth),
            0x02 => Ok(MessageKind::AuthOk),
            0x03 => Ok(MessageKind::StartStream),
            0x04 => Ok(MessageKind::Frame),
            0x05 => Ok(MessageKind::MouseEvent),
            0x06 => Ok(MessageKind::KeyEvent),
            0x07 => Ok(MessageKind::StopStream),
            0x08 => Ok(MessageKind::Heartbeat),
            0x09 => Ok(MessageKind::HeartbeatAck),
            0xFF => Ok(MessageKind::Error),
            other => Err(other),
        }
    }
}

/// Agent credentials and host identity, sent first on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub agent_id: String,
    pub token: String,
    pub hostname: String,
    pub os_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthOkPayload {
    pub agent_id: String,
}

/// Requested stream parameters. Values are clamped at dispatch, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_fps_max")]
    pub fps_max: u32,
}

fn default_quality() -> u8 {
    70
}

fn default_fps_max() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseAction {
    Move,
    Down,
    Up,
    Click,
    DblClick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseEventPayload {
    /// Absolute pixel coordinates on the primary display.
    pub x: i32,
    pub y: i32,
    /// 0 = left, 1 = middle, 2 = right; anything else is treated as left.
    #[serde(default)]
    pub button: u8,
    pub action: MouseAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Meta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEventPayload {
    /// Web-platform key name ("a", "Enter", "ArrowLeft", "F5", ...).
    pub key: String,
    pub action: KeyAction,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Seconds since the supervisor started.
    pub uptime: u64,
    /// Whole-system CPU load percentage.
    pub cpu: f32,
    /// Whole-system memory load percentage.
    pub mem: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// A single screen frame. Carried as binary, not JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload {
    /// Per-stream sequence number; the first frame on the wire carries 1.
    pub seq: u32,
    /// Elapsed milliseconds since stream start, truncated to u32.
    pub timestamp_ms: u32,
    pub jpeg: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Auth(AuthPayload),
    AuthOk(AuthOkPayload),
    StartStream(StreamParams),
    Frame(FramePayload),
    Mouse(MouseEventPayload),
    Key(KeyEventPayload),
    StopStream,
    Heartbeat(HeartbeatPayload),
    HeartbeatAck,
    Error(ErrorPayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Auth(_) => MessageKind::Auth,
            Message::AuthOk(_) => MessageKind::AuthOk,
            Message::StartStream(_) => MessageKind::StartStream,
            Message::Frame(_) => MessageKind::Frame,
            Message::Mouse(_) => MessageKind::MouseEvent,
            Message::Key(_) => MessageKind::KeyEvent,
            Message::StopStream => MessageKind::StopStream,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::HeartbeatAck => MessageKind::HeartbeatAck,
            Message::Error(_) => MessageKind::Error,
        }
    }

    /// Frame this message for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let payload = match self {
            Message::Auth(p) => serde_json::to_vec(p)?,
            Message::AuthOk(p) => serde_json::to_vec(p)?,
            Message::StartStream(p) => serde_json::to_vec(p)?,
            Message::Mouse(p) => serde_json::to_vec(p)?,
            Message::Key(p) => serde_json::to_vec(p)?,
            Message::Heartbeat(p) => serde_json::to_vec(p)?,
            Message::Error(p) => serde_json::to_vec(p)?,
            Message::Frame(f) => {
                let mut buf = Vec::with_capacity(8 + f.jpeg.len());
                buf.extend_from_slice(&f.seq.to_be_bytes());
                buf.extend_from_slice(&f.timestamp_ms.to_be_bytes());
                buf.extend_from_slice(&f.jpeg);
                buf
            }
            Message::StopStream | Message::HeartbeatAck => Vec::new(),
        };

        if payload.len() > u32::MAX as usize {
            return Err(EncodeError::PayloadTooLarge(payload.len()));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(self.kind() as u8);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse a complete wire frame.
    pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }

        let kind = MessageKind::try_from(buf[0]).map_err(DecodeError::UnknownKind)?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len as usize > MAX_PAYLOAD {
            return Err(DecodeError::Oversized(len));
        }
        let len = len as usize;
        if buf.len() < HEADER_LEN + len {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN + len,
                actual: buf.len(),
            });
        }
        let payload = &buf[HEADER_LEN..HEADER_LEN + len];

        let message = match kind {
            MessageKind::Auth => Message::Auth(serde_json::from_slice(payload)?),
            MessageKind::AuthOk => Message::AuthOk(serde_json::from_slice(payload)?),
            MessageKind::StartStream => Message::StartStream(serde_json::from_slice(payload)?),
            MessageKind::MouseEvent => Message::Mouse(serde_json::from_slice(payload)?),
            MessageKind::KeyEvent => Message::Key(serde_json::from_slice(payload)?),
            MessageKind::Heartbeat => Message::Heartbeat(serde_json::from_slice(payload)?),
            MessageKind::Error => Message::Error(serde_json::from_slice(payload)?),
            MessageKind::StopStream => Message::StopStream,
            MessageKind::HeartbeatAck => Message::HeartbeatAck,
            MessageKind::Frame => {
                if payload.len() < 8 {
                    return Err(DecodeError::Truncated {
                        expected: HEADER_LEN + 8,
                        actual: buf.len(),
                    });
                }
                Message::Frame(FramePayload {
                    seq: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    timestamp_ms: u32::from_be_bytes([
                        payload[4], payload[5], payload[6], payload[7],
                    ]),
                    jpeg: payload[8..].to_vec(),
                })
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let bytes = msg.encode().expect("encode");
        let back = Message::decode(&bytes).expect("decode");
        assert_eq!(msg, back);
    }

    #[test]
    fn round_trips_every_kind() {
        round_trip(Message::Auth(AuthPayload {
            agent_id: "a-1".into(),
            token: "t".into(),
            hostname: "H".into(),
            os_info: "OS".into(),
        }));
        round_trip(Message::AuthOk(AuthOkPayload {
            agent_id: "a-1".into(),
        }));
        round_trip(Message::StartStream(StreamParams {
            quality: 70,
            fps_max: 15,
        }));
        round_trip(Message::Frame(FramePayload {
            seq: 1,
            timestamp_ms: 42,
            jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
        }));
        round_trip(Message::Mouse(MouseEventPayload {
            x: 100,
            y: 200,
            button: 2,
            action: MouseAction::DblClick,
        }));
        round_trip(Message::Key(KeyEventPayload {
            key: "Enter".into(),
            action: KeyAction::Down,
            modifiers: vec![Modifier::Ctrl, Modifier::Shift],
        }));
        round_trip(Message::StopStream);
        round_trip(Message::Heartbeat(HeartbeatPayload {
            uptime: 3600,
            cpu: 12.5,
            mem: 48.0,
        }));
        round_trip(Message::HeartbeatAck);
        round_trip(Message::Error(ErrorPayload {
            code: "INVALID_TOKEN".into(),
            message: "bad token".into(),
        }));
    }

    #[test]
    fn header_layout_is_stable() {
        let bytes = Message::StopStream.encode().unwrap();
        assert_eq!(bytes, vec![0x07, 0, 0, 0, 0]);

        let bytes = Message::Frame(FramePayload {
            seq: 1,
            timestamp_ms: 2,
            jpeg: vec![0xAB],
        })
        .encode()
        .unwrap();
        assert_eq!(bytes[0], 0x04);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 9]);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 1]);
        assert_eq!(&bytes[9..13], &[0, 0, 0, 2]);
        assert_eq!(bytes[13], 0xAB);
    }

    #[test]
    fn empty_jpeg_frame_is_well_formed() {
        let msg = Message::Frame(FramePayload {
            seq: 7,
            timestamp_ms: 1234,
            jpeg: Vec::new(),
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[1..5], &[0, 0, 0, 8]);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        assert!(matches!(
            Message::decode(&[0x07, 0, 0]),
            Err(DecodeError::Truncated { .. })
        ));

        let mut bytes = Message::Heartbeat(HeartbeatPayload {
            uptime: 1,
            cpu: 0.0,
            mem: 0.0,
        })
        .encode()
        .unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            Message::decode(&bytes),
            Err(DecodeError::Truncated { .. })
        ));

        // FRAME payload shorter than its own fixed prefix
        let bytes = [0x04, 0, 0, 0, 4, 1, 2, 3, 4];
        assert!(matches!(
            Message::decode(&bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_kind_is_reported_with_the_byte() {
        let bytes = [0x42, 0, 0, 0, 0];
        assert!(matches!(
            Message::decode(&bytes),
            Err(DecodeError::UnknownKind(0x42))
        ));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let mut bytes = vec![0x03];
        let body = b"{not json";
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(body);
        assert!(matches!(
            Message::decode(&bytes),
            Err(DecodeError::MalformedJson(_))
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let bytes = [0x04, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            Message::decode(&bytes),
            Err(DecodeError::Oversized(_))
        ));
    }

    #[test]
    fn unknown_json_fields_are_ignored_and_defaults_fill_in() {
        let body = br#"{"quality":55,"future_field":true}"#;
        let mut bytes = vec![0x03];
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(body);
        match Message::decode(&bytes).unwrap() {
            Message::StartStream(p) => {
                assert_eq!(p.quality, 55);
                assert_eq!(p.fps_max, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mouse_defaults_button_to_left() {
        let body = br#"{"x":1,"y":2,"action":"click"}"#;
        let mut bytes = vec![0x05];
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(body);
        match Message::decode(&bytes).unwrap() {
            Message::Mouse(p) => {
                assert_eq!(p.button, 0);
                assert_eq!(p.action, MouseAction::Click);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
