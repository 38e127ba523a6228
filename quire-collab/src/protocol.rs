//! Wire protocol: binary frames and JSON control envelopes.
//!
//! ## Binary frames
//!
//! ```text
//! ┌───────┬──────────────────────────────────────────────┐
//! │ class │ payload                                      │
//! ├───────┼──────────────────────────────────────────────┤
//! │   0   │ varint(len) ‖ Yrs update (len bytes)         │
//! │   1   │ bincode AwarenessPayload                     │
//! └───────┴──────────────────────────────────────────────┘
//! ```
//!
//! ## Control envelopes (text frames)
//!
//! `{ "type", "roomId"?, "clientId"?, "data"?, "timestamp" }`. The loose
//! JSON shape is only used at the edge: [`ControlEnvelope::from_json`] turns
//! it into a [`ControlMessage`] that the rest of the crate matches on
//! exhaustively. Byte fields inside `data` are base64.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthenticatedUser;
use crate::awareness::CursorPosition;

/// Leading byte of a document-sync frame.
pub const FRAME_SYNC: u8 = 0;
/// Leading byte of an awareness frame.
pub const FRAME_AWARENESS: u8 = 1;

/// Longest LEB128 encoding of a u64.
const MAX_VARINT_LEN: usize = 10;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown frame class {0}")]
    UnknownClass(u8),
    #[error("truncated length prefix")]
    TruncatedLength,
    #[error("length prefix says {declared} bytes, frame carries {actual}")]
    LengthMismatch { declared: u64, actual: usize },
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("invalid JSON envelope: {0}")]
    Json(String),
    #[error("unknown control message type '{0}'")]
    UnknownType(String),
    #[error("invalid data for '{kind}': {reason}")]
    InvalidData { kind: String, reason: String },
    #[error("unexpected message: {0}")]
    Unexpected(String),
}

// ───────────────────────────────────────────────────────────────────
// Varint (unsigned LEB128)
// ───────────────────────────────────────────────────────────────────

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Returns the value and the number of bytes consumed.
pub fn read_varint(bytes: &[u8]) -> Result<(u64, usize), ProtocolError> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(ProtocolError::TruncatedLength)
}

// ───────────────────────────────────────────────────────────────────
// Binary frames
// ───────────────────────────────────────────────────────────────────

/// A decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Yrs update bytes.
    Sync(Vec<u8>),
    /// Encoded `AwarenessPayload`.
    Awareness(Vec<u8>),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Sync(delta) => encode_sync_frame(delta),
            Frame::Awareness(payload) => encode_awareness_frame(payload),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&class, rest) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match class {
            FRAME_SYNC => {
                let (declared, used) = read_varint(rest)?;
                let body = &rest[used..];
                if declared != body.len() as u64 {
                    return Err(ProtocolError::LengthMismatch {
                        declared,
                        actual: body.len(),
                    });
                }
                Ok(Frame::Sync(body.to_vec()))
            }
            FRAME_AWARENESS => Ok(Frame::Awareness(rest.to_vec())),
            other => Err(ProtocolError::UnknownClass(other)),
        }
    }
}

pub fn encode_sync_frame(delta: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + MAX_VARINT_LEN + delta.len());
    out.push(FRAME_SYNC);
    write_varint(&mut out, delta.len() as u64);
    out.extend_from_slice(delta);
    out
}

pub fn encode_awareness_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(FRAME_AWARENESS);
    out.extend_from_slice(payload);
    out
}

// ───────────────────────────────────────────────────────────────────
// Control messages
// ───────────────────────────────────────────────────────────────────

/// Machine-readable reason carried by `error` control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRoom,
    NotInRoom,
    MalformedMessage,
    MergeFailed,
    Internal,
}

/// Every control message the engine speaks.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    JoinRoom {
        project_id: Option<String>,
        file_id: Option<String>,
    },
    LeaveRoom,
    /// `None` clears the cursor.
    CursorMove { cursor: Option<CursorPosition> },
    DocumentUpdate { update: Vec<u8> },
    /// Without a state vector the full state is returned.
    SyncRequest { state_vector: Option<Vec<u8>> },
    SyncResponse {
        update: Vec<u8>,
        state_vector: Vec<u8>,
    },
    RoomJoined {
        project_id: String,
        file_id: String,
        connections: usize,
    },
    Authenticated { user: AuthenticatedUser },
    Error { code: ErrorCode, message: String },
}

impl ControlMessage {
    /// Value of the envelope `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::JoinRoom { .. } => "join_room",
            ControlMessage::LeaveRoom => "leave_room",
            ControlMessage::CursorMove { .. } => "cursor_move",
            ControlMessage::DocumentUpdate { .. } => "document_update",
            ControlMessage::SyncRequest { .. } => "sync_request",
            ControlMessage::SyncResponse { .. } => "sync_response",
            ControlMessage::RoomJoined { .. } => "room_joined",
            ControlMessage::Authenticated { .. } => "authenticated",
            ControlMessage::Error { .. } => "error",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ControlMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Code of an `error` message, `None` for every other type.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ControlMessage::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn data(&self) -> Result<Option<Value>, ProtocolError> {
        let value = match self {
            ControlMessage::JoinRoom { project_id, file_id } => to_value(&JoinRoomData {
                project_id: project_id.clone(),
                file_id: file_id.clone(),
            })?,
            ControlMessage::LeaveRoom => return Ok(None),
            ControlMessage::CursorMove { cursor } => to_value(cursor)?,
            ControlMessage::DocumentUpdate { update } => to_value(&DocumentUpdateData {
                update: update.clone(),
            })?,
            ControlMessage::SyncRequest { state_vector } => to_value(&SyncRequestData {
                state_vector: state_vector.clone(),
            })?,
            ControlMessage::SyncResponse { update, state_vector } => to_value(&SyncResponseData {
                update: update.clone(),
                state_vector: state_vector.clone(),
            })?,
            ControlMessage::RoomJoined {
                project_id,
                file_id,
                connections,
            } => to_value(&RoomJoinedData {
                project_id: project_id.clone(),
                file_id: file_id.clone(),
                connections: *connections,
            })?,
            ControlMessage::Authenticated { user } => to_value(user)?,
            ControlMessage::Error { code, message } => to_value(&ErrorData {
                code: *code,
                message: message.clone(),
            })?,
        };
        Ok(Some(value))
    }

    fn from_parts(kind: &str, data: Option<Value>) -> Result<Self, ProtocolError> {
        let message = match kind {
            "join_room" => {
                let d: JoinRoomData = from_optional(kind, data)?;
                ControlMessage::JoinRoom {
                    project_id: d.project_id,
                    file_id: d.file_id,
                }
            }
            "leave_room" => ControlMessage::LeaveRoom,
            "cursor_move" => ControlMessage::CursorMove {
                cursor: from_optional(kind, data)?,
            },
            "document_update" => {
                let d: DocumentUpdateData = from_required(kind, data)?;
                ControlMessage::DocumentUpdate { update: d.update }
            }
            "sync_request" => {
                let d: SyncRequestData = from_optional(kind, data)?;
                ControlMessage::SyncRequest {
                    state_vector: d.state_vector,
                }
            }
            "sync_response" => {
                let d: SyncResponseData = from_required(kind, data)?;
                ControlMessage::SyncResponse {
                    update: d.update,
                    state_vector: d.state_vector,
                }
            }
            "room_joined" => {
                let d: RoomJoinedData = from_required(kind, data)?;
                ControlMessage::RoomJoined {
                    project_id: d.project_id,
                    file_id: d.file_id,
                    connections: d.connections,
                }
            }
            "authenticated" => ControlMessage::Authenticated {
                user: from_required(kind, data)?,
            },
            "error" => {
                let d: ErrorData = from_required(kind, data)?;
                ControlMessage::Error {
                    code: d.code,
                    message: d.message,
                }
            }
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(message)
    }
}

/// A control message plus its routing fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEnvelope {
    pub message: ControlMessage,
    pub room_id: Option<String>,
    pub client_id: Option<String>,
    pub timestamp: u64,
}

/// Shape of the envelope on the wire.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default)]
    timestamp: u64,
}

impl ControlEnvelope {
    pub fn new(message: ControlMessage) -> Self {
        Self {
            message,
            room_id: None,
            client_id: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn with_client(mut self, client_id: impl ToString) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let raw = RawEnvelope {
            kind: self.message.kind().to_string(),
            room_id: self.room_id.clone(),
            client_id: self.client_id.clone(),
            data: self.message.data()?,
            timestamp: self.timestamp,
        };
        serde_json::to_string(&raw).map_err(|e| ProtocolError::Json(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Json(e.to_string()))?;
        Ok(Self {
            message: ControlMessage::from_parts(&raw.kind, raw.data)?,
            room_id: raw.room_id,
            client_id: raw.client_id,
            timestamp: raw.timestamp,
        })
    }
}

// ─── data payloads ────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentUpdateData {
    #[serde(with = "base64_bytes")]
    update: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequestData {
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes::option")]
    state_vector: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponseData {
    #[serde(with = "base64_bytes")]
    update: Vec<u8>,
    #[serde(with = "base64_bytes")]
    state_vector: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomJoinedData {
    project_id: String,
    file_id: String,
    connections: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorData {
    code: ErrorCode,
    message: String,
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Json(e.to_string()))
}

fn from_required<T: serde::de::DeserializeOwned>(
    kind: &str,
    data: Option<Value>,
) -> Result<T, ProtocolError> {
    let value = data.ok_or_else(|| ProtocolError::InvalidData {
        kind: kind.to_string(),
        reason: "missing data".to_string(),
    })?;
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidData {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Absent or `null` data deserializes as `T::default()`.
fn from_optional<T: serde::de::DeserializeOwned + Default>(
    kind: &str,
    data: Option<Value>,
) -> Result<T, ProtocolError> {
    match data {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| ProtocolError::InvalidData {
            kind: kind.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Base64 (standard alphabet, padded) for byte fields inside JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let text = Option::<String>::deserialize(deserializer)?;
            text.map(|t| STANDARD.decode(t.as_bytes()).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
