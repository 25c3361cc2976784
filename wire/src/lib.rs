//! Shared message model and protobuf codec for the realtime room transport.
//!
//! This crate owns the wire representation used by the room server and any
//! native client. It keeps drawing payloads flexible (`serde_json::Value`)
//! while encoding the envelope over protobuf for compact binary transport —
//! canvas-update churn dominates room traffic, so per-message overhead
//! matters more than schema rigor at this boundary.

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// ERRORS
// =============================================================================

/// Error returned by [`decode_message`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireMessage`.
    #[error("failed to decode protobuf message: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The envelope decoded but carries a kind this build does not know.
    /// Receivers treat this as forward-compatible, not as corruption.
    #[error("unknown message kind: {0}")]
    UnknownKind(i32),
    /// The envelope is missing a field its kind requires.
    #[error("{kind} payload missing field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
    /// The payload decoded but does not match the kind's expected shape.
    #[error("invalid {kind} payload: {reason}")]
    Payload { kind: &'static str, reason: String },
}

// =============================================================================
// ROOM SNAPSHOT
// =============================================================================

/// The authoritative shared state of one room.
///
/// Drawing content is opaque to the transport: the room stores and forwards
/// `elements`/`appState`/`files` as whole units and never inspects element
/// internals. Field groups are replaced wholesale per update kind, which is
/// what makes last-write-wins explicit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    /// Ordered drawing elements, replaced as a unit on each canvas update.
    #[serde(default = "empty_array")]
    pub elements: Value,
    /// Viewport/selection blob, replaced together with `elements`.
    #[serde(default = "empty_object")]
    pub app_state: Value,
    /// Blob-id to binary payload map, replaced together with `elements`.
    #[serde(default = "empty_object")]
    pub files: Value,
    /// Ordered note records, replaced as a unit on each markdown update.
    #[serde(default = "empty_array")]
    pub markdown_notes: Value,
    /// Ordered generated-image records, replaced as a unit on each image update.
    #[serde(default = "empty_array")]
    pub image_history: Value,
    /// Milliseconds since the Unix epoch of the last accepted activity.
    #[serde(default)]
    pub last_activity_at: i64,
    /// Set on the first content update, immutable afterwards.
    #[serde(default)]
    pub created_at: Option<i64>,
}

fn empty_array() -> Value {
    Value::Array(Vec::new())
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl RoomSnapshot {
    /// An empty snapshot with no recorded activity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            elements: empty_array(),
            app_state: empty_object(),
            files: empty_object(),
            markdown_notes: empty_array(),
            image_history: empty_array(),
            last_activity_at: 0,
            created_at: None,
        }
    }
}

impl Default for RoomSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// A single message on the room wire protocol.
#[derive(Clone, Debug, PartialEq)]
pub enum RoomMessage {
    /// Full-state snapshot sent to a connection right after it attaches.
    /// `state` is `None` for a room that has never accepted a content update.
    Init { state: Option<RoomSnapshot>, active_users: u32 },
    /// Sent to a connecting client whose room sat idle past retention.
    RoomExpired { message: String, inactive_days: u64 },
    /// Presence delta broadcast to existing connections.
    UserJoined { user_id: String, active_users: u32 },
    /// Presence delta broadcast to remaining connections.
    UserLeft { user_id: String, active_users: u32 },
    /// Wholesale replacement of the drawing group.
    CanvasUpdate { elements: Value, app_state: Value, files: Value },
    /// Wholesale replacement of the note list.
    MarkdownUpdate { markdown_notes: Value },
    /// Wholesale replacement of the generated-image list.
    ImageUpdate { image_history: Value },
}

impl RoomMessage {
    /// Wire name of this message's kind, e.g. `"canvas-update"`.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Init { .. } => WireKind::Init.name(),
            Self::RoomExpired { .. } => WireKind::RoomExpired.name(),
            Self::UserJoined { .. } => WireKind::UserJoined.name(),
            Self::UserLeft { .. } => WireKind::UserLeft.name(),
            Self::CanvasUpdate { .. } => WireKind::CanvasUpdate.name(),
            Self::MarkdownUpdate { .. } => WireKind::MarkdownUpdate.name(),
            Self::ImageUpdate { .. } => WireKind::ImageUpdate.name(),
        }
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a message into protobuf bytes.
///
/// # Panics
///
/// Never panics in practice; writing to `Vec<u8>` is infallible.
#[must_use]
pub fn encode_message(message: &RoomMessage) -> Vec<u8> {
    let wire = message_to_wire(message);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a Vec<u8> is infallible; the only error prost returns
    // here is `BufferTooSmall`, which cannot occur with a growable Vec.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a message.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes,
/// [`CodecError::UnknownKind`] for an out-of-range kind, and
/// [`CodecError::MissingField`]/[`CodecError::Payload`] when the envelope is
/// valid but the payload does not match its kind.
pub fn decode_message(bytes: &[u8]) -> Result<RoomMessage, CodecError> {
    let wire = WireMessage::decode(bytes)?;
    wire_to_message(wire)
}

fn message_to_wire(message: &RoomMessage) -> WireMessage {
    let mut wire = WireMessage { kind: 0, active_users: None, user_id: None, inactive_days: None, message: None, payload: None };

    match message {
        RoomMessage::Init { state, active_users } => {
            wire.kind = WireKind::Init as i32;
            wire.active_users = Some(*active_users);
            wire.payload = state
                .as_ref()
                .map(|s| json_to_proto_value(&serde_json::to_value(s).unwrap_or_default()));
        }
        RoomMessage::RoomExpired { message, inactive_days } => {
            wire.kind = WireKind::RoomExpired as i32;
            wire.message = Some(message.clone());
            wire.inactive_days = Some(*inactive_days);
        }
        RoomMessage::UserJoined { user_id, active_users } => {
            wire.kind = WireKind::UserJoined as i32;
            wire.user_id = Some(user_id.clone());
            wire.active_users = Some(*active_users);
        }
        RoomMessage::UserLeft { user_id, active_users } => {
            wire.kind = WireKind::UserLeft as i32;
            wire.user_id = Some(user_id.clone());
            wire.active_users = Some(*active_users);
        }
        RoomMessage::CanvasUpdate { elements, app_state, files } => {
            wire.kind = WireKind::CanvasUpdate as i32;
            let mut payload = Map::new();
            payload.insert("elements".into(), elements.clone());
            payload.insert("appState".into(), app_state.clone());
            payload.insert("files".into(), files.clone());
            wire.payload = Some(json_to_proto_value(&Value::Object(payload)));
        }
        RoomMessage::MarkdownUpdate { markdown_notes } => {
            wire.kind = WireKind::MarkdownUpdate as i32;
            let mut payload = Map::new();
            payload.insert("markdownNotes".into(), markdown_notes.clone());
            wire.payload = Some(json_to_proto_value(&Value::Object(payload)));
        }
        RoomMessage::ImageUpdate { image_history } => {
            wire.kind = WireKind::ImageUpdate as i32;
            let mut payload = Map::new();
            payload.insert("imageHistory".into(), image_history.clone());
            wire.payload = Some(json_to_proto_value(&Value::Object(payload)));
        }
    }

    wire
}

fn wire_to_message(wire: WireMessage) -> Result<RoomMessage, CodecError> {
    let kind = WireKind::try_from(wire.kind).map_err(|_| CodecError::UnknownKind(wire.kind))?;
    let name = kind.name();

    let message = match kind {
        WireKind::Init => {
            let state = wire
                .payload
                .map(|v| {
                    serde_json::from_value::<RoomSnapshot>(proto_to_json_value(&v))
                        .map_err(|e| CodecError::Payload { kind: name, reason: e.to_string() })
                })
                .transpose()?;
            RoomMessage::Init { state, active_users: required(wire.active_users, name, "active_users")? }
        }
        WireKind::RoomExpired => RoomMessage::RoomExpired {
            message: required(wire.message, name, "message")?,
            inactive_days: required(wire.inactive_days, name, "inactive_days")?,
        },
        WireKind::UserJoined => RoomMessage::UserJoined {
            user_id: required(wire.user_id, name, "user_id")?,
            active_users: required(wire.active_users, name, "active_users")?,
        },
        WireKind::UserLeft => RoomMessage::UserLeft {
            user_id: required(wire.user_id, name, "user_id")?,
            active_users: required(wire.active_users, name, "active_users")?,
        },
        WireKind::CanvasUpdate => {
            let mut payload = payload_object(wire.payload, name)?;
            RoomMessage::CanvasUpdate {
                elements: take_field(&mut payload, name, "elements")?,
                app_state: take_field(&mut payload, name, "appState")?,
                files: take_field(&mut payload, name, "files")?,
            }
        }
        WireKind::MarkdownUpdate => {
            let mut payload = payload_object(wire.payload, name)?;
            RoomMessage::MarkdownUpdate { markdown_notes: take_field(&mut payload, name, "markdownNotes")? }
        }
        WireKind::ImageUpdate => {
            let mut payload = payload_object(wire.payload, name)?;
            RoomMessage::ImageUpdate { image_history: take_field(&mut payload, name, "imageHistory")? }
        }
    };

    Ok(message)
}

fn required<T>(field: Option<T>, kind: &'static str, name: &'static str) -> Result<T, CodecError> {
    field.ok_or(CodecError::MissingField { kind, field: name })
}

fn payload_object(
    payload: Option<prost_types::Value>,
    kind: &'static str,
) -> Result<Map<String, Value>, CodecError> {
    let value = payload.ok_or(CodecError::MissingField { kind, field: "payload" })?;
    match proto_to_json_value(&value) {
        Value::Object(map) => Ok(map),
        other => Err(CodecError::Payload {
            kind,
            reason: format!("expected object payload, got {other}"),
        }),
    }
}

fn take_field(payload: &mut Map<String, Value>, kind: &'static str, field: &'static str) -> Result<Value, CodecError> {
    payload.remove(field).ok_or(CodecError::MissingField { kind, field })
}

// =============================================================================
// JSON <-> PROTOBUF VALUE
// =============================================================================

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => {
            prost_types::value::Kind::NullValue(prost_types::NullValue::NullValue as i32)
        }
        Value::Bool(v) => prost_types::value::Kind::BoolValue(*v),
        Value::Number(v) => prost_types::value::Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => prost_types::value::Kind::StringValue(v.clone()),
        Value::Array(v) => prost_types::value::Kind::ListValue(prost_types::ListValue {
            values: v.iter().map(json_to_proto_value).collect(),
        }),
        Value::Object(v) => prost_types::value::Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        prost_types::value::Kind::NullValue(_) => Value::Null,
        prost_types::value::Kind::NumberValue(v) => {
            // Protobuf Struct numbers are always doubles. Integral values are
            // restored as JSON integers so typed fields (timestamps, counts)
            // survive a decode into i64/u64 targets.
            if v.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(v) {
                Value::Number(serde_json::Number::from(*v as i64))
            } else {
                serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number)
            }
        }
        prost_types::value::Kind::StringValue(v) => Value::String(v.clone()),
        prost_types::value::Kind::BoolValue(v) => Value::Bool(*v),
        prost_types::value::Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        prost_types::value::Kind::ListValue(v) => {
            Value::Array(v.values.iter().map(proto_to_json_value).collect())
        }
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Clone, PartialEq, prost::Message)]
struct WireMessage {
    #[prost(enumeration = "WireKind", tag = "1")]
    kind: i32,
    #[prost(uint32, optional, tag = "2")]
    active_users: Option<u32>,
    #[prost(string, optional, tag = "3")]
    user_id: Option<String>,
    #[prost(uint64, optional, tag = "4")]
    inactive_days: Option<u64>,
    #[prost(string, optional, tag = "5")]
    message: Option<String>,
    #[prost(message, optional, tag = "6")]
    payload: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireKind {
    Init = 0,
    RoomExpired = 1,
    UserJoined = 2,
    UserLeft = 3,
    CanvasUpdate = 4,
    MarkdownUpdate = 5,
    ImageUpdate = 6,
}

impl WireKind {
    fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::RoomExpired => "room-expired",
            Self::UserJoined => "user-joined",
            Self::UserLeft => "user-left",
            Self::CanvasUpdate => "canvas-update",
            Self::MarkdownUpdate => "markdown-update",
            Self::ImageUpdate => "image-update",
        }
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
