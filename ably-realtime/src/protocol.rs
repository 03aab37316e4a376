//! Ably wire protocol types, constants, and MessagePack/JSON encode/decode.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::Error;
use crate::error::{ErrorInfo, error_code};

// ---------------------------------------------------------------------------
// Protocol action constants
// ---------------------------------------------------------------------------

pub mod action {
    pub const HEARTBEAT: i32 = 0;
    pub const ACK: i32 = 1;
    pub const NACK: i32 = 2;
    pub const CONNECT: i32 = 3;
    pub const CONNECTED: i32 = 4;
    pub const DISCONNECT: i32 = 5;
    pub const DISCONNECTED: i32 = 6;
    pub const CLOSE: i32 = 7;
    pub const CLOSED: i32 = 8;
    pub const ERROR: i32 = 9;
    pub const ATTACH: i32 = 10;
    pub const ATTACHED: i32 = 11;
    pub const DETACH: i32 = 12;
    pub const DETACHED: i32 = 13;
    pub const PRESENCE: i32 = 14;
    pub const MESSAGE: i32 = 15;
    pub const SYNC: i32 = 16;
    pub const AUTH: i32 = 17;
    pub const ACTIVATE: i32 = 18;
    pub const ANNOTATION: i32 = 21;
}

pub mod flags {
    // Channel attach state flags
    pub const HAS_PRESENCE: i32 = 1;
    pub const HAS_BACKLOG: i32 = 1 << 1;
    pub const RESUMED: i32 = 1 << 2;
    pub const TRANSIENT: i32 = 1 << 4;
    pub const ATTACH_RESUME: i32 = 1 << 5; // 32
    // Channel mode flags
    pub const MODE_PRESENCE: i32 = 1 << 16;
    pub const MODE_PUBLISH: i32 = 1 << 17;
    pub const MODE_SUBSCRIBE: i32 = 262_144; // bit 18
    pub const MODE_PRESENCE_SUBSCRIBE: i32 = 1 << 19;
    pub const MODE_ANNOTATION_PUBLISH: i32 = 1 << 21;
    pub const MODE_ANNOTATION_SUBSCRIBE: i32 = 1 << 22;
}

/// Actions whose delivery the server acknowledges with ACK/NACK.
pub(crate) fn ack_required(action: i32) -> bool {
    matches!(
        action,
        action::MESSAGE | action::PRESENCE | action::ANNOTATION
    )
}

// ---------------------------------------------------------------------------
// Payload data
// ---------------------------------------------------------------------------

/// A message payload as carried on the wire.
///
/// MessagePack binary values decode to [`WireData::Binary`]; strings stay
/// strings. Structured values only appear when a peer sends them unencoded.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum WireData {
    #[default]
    Null,
    String(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl WireData {
    pub fn is_null(&self) -> bool {
        matches!(self, WireData::Null)
    }
}

impl Serialize for WireData {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            WireData::Null => s.serialize_unit(),
            WireData::String(v) => s.serialize_str(v),
            WireData::Binary(v) => s.serialize_bytes(v),
            WireData::Json(v) => v.serialize(s),
        }
    }
}

struct WireDataVisitor;

impl<'de> Visitor<'de> for WireDataVisitor {
    type Value = WireData;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("message data")
    }

    fn visit_unit<E: de::Error>(self) -> Result<WireData, E> {
        Ok(WireData::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<WireData, E> {
        Ok(WireData::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<WireData, D::Error> {
        d.deserialize_any(WireDataVisitor)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<WireData, E> {
        Ok(WireData::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<WireData, E> {
        Ok(WireData::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<WireData, E> {
        Ok(WireData::Binary(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<WireData, E> {
        Ok(WireData::Binary(v))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<WireData, E> {
        Ok(WireData::Json(v.into()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<WireData, E> {
        Ok(WireData::Json(v.into()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<WireData, E> {
        Ok(WireData::Json(v.into()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<WireData, E> {
        Ok(WireData::Json(
            serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, Into::into),
        ))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<WireData, A::Error> {
        let v = serde_json::Value::deserialize(de::value::SeqAccessDeserializer::new(seq))?;
        Ok(WireData::Json(v))
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<WireData, A::Error> {
        let v = serde_json::Value::deserialize(de::value::MapAccessDeserializer::new(map))?;
        Ok(WireData::Json(v))
    }
}

impl<'de> Deserialize<'de> for WireData {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_any(WireDataVisitor)
    }
}

// ---------------------------------------------------------------------------
// Wire protocol types
// ---------------------------------------------------------------------------

// NOTE: We intentionally omit `skip_serializing_if = "Option::is_none"` on
// these structs. rmp_serde has a long-standing bug where skipped Option fields
// cause deserialization failures: https://github.com/3Hren/msgpack-rust/issues/86
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: i32,
    pub id: Option<String>,
    pub channel: Option<String>,
    pub channel_serial: Option<String>,
    pub connection_id: Option<String>,
    /// Pre-v2 servers send the key at the top level instead of in details.
    pub connection_key: Option<String>,
    pub connection_serial: Option<i64>,
    pub connection_details: Option<ConnectionDetails>,
    pub msg_serial: Option<i64>,
    pub count: Option<i64>,
    pub flags: Option<i32>,
    pub error: Option<ErrorInfo>,
    pub auth: Option<AuthDetails>,
    pub messages: Option<Vec<WireMessage>>,
    pub presence: Option<Vec<WirePresenceMessage>>,
    pub annotations: Option<Vec<WireAnnotation>>,
    pub timestamp: Option<i64>,
    pub params: Option<HashMap<String, String>>,
}

impl ProtocolMessage {
    pub fn new(action: i32) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_state_ttl: Option<i64>,
    pub max_idle_interval: Option<i64>,
    pub max_message_size: Option<i64>,
    pub max_frame_size: Option<i64>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WireMessage {
    pub id: Option<String>,
    pub name: Option<String>,
    pub data: WireData,
    pub encoding: Option<String>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub timestamp: Option<i64>,
    pub extras: Option<serde_json::Value>,
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WirePresenceMessage {
    pub id: Option<String>,
    pub action: i32,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub data: WireData,
    pub encoding: Option<String>,
    pub timestamp: Option<i64>,
    pub extras: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WireAnnotation {
    pub id: Option<String>,
    pub action: i32,
    pub serial: Option<String>,
    pub message_serial: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub count: Option<i64>,
    pub data: WireData,
    pub encoding: Option<String>,
    pub client_id: Option<String>,
    pub timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Typed inbound messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Connected {
    pub connection_id: String,
    pub connection_key: Option<String>,
    pub details: ConnectionDetails,
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attached {
    pub channel: String,
    pub channel_serial: Option<String>,
    pub flags: i32,
    pub params: Option<HashMap<String, String>>,
    pub error: Option<ErrorInfo>,
}

impl Attached {
    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags & flag != 0
    }
}

/// Envelope of a MESSAGE, PRESENCE, SYNC or ANNOTATION frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFrame<T> {
    pub channel: String,
    pub id: Option<String>,
    pub connection_id: Option<String>,
    pub channel_serial: Option<String>,
    pub timestamp: Option<i64>,
    pub items: Vec<T>,
}

/// A received protocol message, one variant per action.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat {
        id: Option<String>,
    },
    Ack {
        msg_serial: i64,
        count: i64,
    },
    Nack {
        msg_serial: i64,
        count: i64,
        error: Option<ErrorInfo>,
    },
    Connected(Connected),
    Disconnected {
        error: Option<ErrorInfo>,
    },
    Closed,
    /// Connection-wide when `channel` is `None`.
    Error {
        channel: Option<String>,
        error: Option<ErrorInfo>,
    },
    Attached(Attached),
    Detached {
        channel: String,
        error: Option<ErrorInfo>,
    },
    Message(ChannelFrame<WireMessage>),
    Presence(ChannelFrame<WirePresenceMessage>),
    Sync(ChannelFrame<WirePresenceMessage>),
    Annotation(ChannelFrame<WireAnnotation>),
    Auth,
    /// Actions a client never expects to receive.
    Other(i32),
}

impl Inbound {
    pub fn name(&self) -> &'static str {
        match self {
            Inbound::Heartbeat { .. } => "HEARTBEAT",
            Inbound::Ack { .. } => "ACK",
            Inbound::Nack { .. } => "NACK",
            Inbound::Connected(_) => "CONNECTED",
            Inbound::Disconnected { .. } => "DISCONNECTED",
            Inbound::Closed => "CLOSED",
            Inbound::Error { .. } => "ERROR",
            Inbound::Attached(_) => "ATTACHED",
            Inbound::Detached { .. } => "DETACHED",
            Inbound::Message(_) => "MESSAGE",
            Inbound::Presence(_) => "PRESENCE",
            Inbound::Sync(_) => "SYNC",
            Inbound::Annotation(_) => "ANNOTATION",
            Inbound::Auth => "AUTH",
            Inbound::Other(_) => "OTHER",
        }
    }

    /// The channel a frame is addressed to, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Inbound::Error { channel, .. } => channel.as_deref(),
            Inbound::Attached(a) => Some(&a.channel),
            Inbound::Detached { channel, .. } => Some(channel),
            Inbound::Message(f) => Some(&f.channel),
            Inbound::Presence(f) | Inbound::Sync(f) => Some(&f.channel),
            Inbound::Annotation(f) => Some(&f.channel),
            _ => None,
        }
    }
}

fn missing(field: &str, action: i32) -> ErrorInfo {
    ErrorInfo::new(
        error_code::BAD_REQUEST,
        400,
        format!("protocol message with action {action} is missing {field}"),
    )
}

fn frame<T>(msg: &mut ProtocolMessage, items: Option<Vec<T>>) -> Result<ChannelFrame<T>, ErrorInfo> {
    Ok(ChannelFrame {
        channel: msg.channel.take().ok_or_else(|| missing("channel", msg.action))?,
        id: msg.id.take(),
        connection_id: msg.connection_id.take(),
        channel_serial: msg.channel_serial.take(),
        timestamp: msg.timestamp,
        items: items.unwrap_or_default(),
    })
}

impl TryFrom<ProtocolMessage> for Inbound {
    type Error = ErrorInfo;

    fn try_from(mut msg: ProtocolMessage) -> Result<Self, ErrorInfo> {
        let a = msg.action;
        Ok(match a {
            action::HEARTBEAT => Inbound::Heartbeat { id: msg.id },
            action::ACK => Inbound::Ack {
                msg_serial: msg.msg_serial.ok_or_else(|| missing("msgSerial", a))?,
                count: msg.count.unwrap_or(1),
            },
            action::NACK => Inbound::Nack {
                msg_serial: msg.msg_serial.ok_or_else(|| missing("msgSerial", a))?,
                count: msg.count.unwrap_or(1),
                error: msg.error,
            },
            action::CONNECTED => {
                let details = msg.connection_details.unwrap_or_default();
                Inbound::Connected(Connected {
                    connection_id: msg.connection_id.ok_or_else(|| missing("connectionId", a))?,
                    connection_key: details.connection_key.clone().or(msg.connection_key),
                    details,
                    error: msg.error,
                })
            }
            action::DISCONNECTED => Inbound::Disconnected { error: msg.error },
            action::CLOSED => Inbound::Closed,
            action::ERROR => Inbound::Error {
                channel: msg.channel,
                error: msg.error,
            },
            action::ATTACHED => Inbound::Attached(Attached {
                channel: msg.channel.ok_or_else(|| missing("channel", a))?,
                channel_serial: msg.channel_serial,
                flags: msg.flags.unwrap_or(0),
                params: msg.params,
                error: msg.error,
            }),
            action::DETACHED => Inbound::Detached {
                channel: msg.channel.ok_or_else(|| missing("channel", a))?,
                error: msg.error,
            },
            action::MESSAGE => {
                let items = msg.messages.take();
                Inbound::Message(frame(&mut msg, items)?)
            }
            action::PRESENCE => {
                let items = msg.presence.take();
                Inbound::Presence(frame(&mut msg, items)?)
            }
            action::SYNC => {
                let items = msg.presence.take();
                Inbound::Sync(frame(&mut msg, items)?)
            }
            action::ANNOTATION => {
                let items = msg.annotations.take();
                Inbound::Annotation(frame(&mut msg, items)?)
            }
            action::AUTH => Inbound::Auth,
            other => Inbound::Other(other),
        })
    }
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

/// Frame serialisation negotiated with the `format` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    MsgPack,
    Json,
}

impl Format {
    pub(crate) fn from_binary(binary: bool) -> Self {
        if binary { Format::MsgPack } else { Format::Json }
    }

    /// Value of the `format` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            Format::MsgPack => "msgpack",
            Format::Json => "json",
        }
    }
}

pub fn encode_msg(msg: &ProtocolMessage, format: Format) -> Result<Vec<u8>, Error> {
    match format {
        Format::MsgPack => Ok(rmp_serde::to_vec_named(msg)?),
        Format::Json => Ok(serde_json::to_vec(msg)?),
    }
}

pub fn decode_msg(data: &[u8], format: Format) -> Result<ProtocolMessage, Error> {
    match format {
        Format::MsgPack => {
            // msgpack → rmpv::Value → ProtocolMessage, going through a Value so
            // that duplicated map keys (Ably may send "messages" twice) collapse
            // to the last occurrence before the struct deserializer sees them.
            let mut cursor = std::io::Cursor::new(data);
            let value = rmpv::decode::read_value(&mut cursor)
                .map_err(|e| Error::MsgpackDecode(format!("msgpack decode error: {e}")))?;
            rmpv::ext::from_value(dedup_keys(value))
                .map_err(|e| Error::MsgpackDecode(format!("message decode error: {e}")))
        }
        Format::Json => Ok(serde_json::from_slice(data)?),
    }
}

fn dedup_keys(value: rmpv::Value) -> rmpv::Value {
    match value {
        rmpv::Value::Map(entries) => {
            let mut out: Vec<(rmpv::Value, rmpv::Value)> = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let v = dedup_keys(v);
                if let Some(slot) = out.iter_mut().find(|(existing, _)| *existing == k) {
                    slot.1 = v;
                } else {
                    out.push((k, v));
                }
            }
            rmpv::Value::Map(out)
        }
        rmpv::Value::Array(items) => {
            rmpv::Value::Array(items.into_iter().map(dedup_keys).collect())
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Outbound message builders
// ---------------------------------------------------------------------------

pub fn build_attach_msg(
    channel: &str,
    params: Option<HashMap<String, String>>,
    channel_serial: Option<&str>,
    mode_flags: i32,
    resume: bool,
) -> ProtocolMessage {
    let mut f = mode_flags;
    if resume {
        f |= flags::ATTACH_RESUME;
    }
    ProtocolMessage {
        action: action::ATTACH,
        channel: Some(channel.to_string()),
        channel_serial: channel_serial.map(str::to_string),
        flags: if f == 0 { None } else { Some(f) },
        params,
        ..Default::default()
    }
}

pub fn build_detach_msg(channel: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: action::DETACH,
        channel: Some(channel.to_string()),
        ..Default::default()
    }
}

pub fn build_sync_msg(channel: &str, channel_serial: Option<&str>) -> ProtocolMessage {
    ProtocolMessage {
        action: action::SYNC,
        channel: Some(channel.to_string()),
        channel_serial: channel_serial.map(str::to_string),
        ..Default::default()
    }
}

pub fn build_activate_msg() -> ProtocolMessage {
    ProtocolMessage::new(action::ACTIVATE)
}

pub fn build_close_msg() -> ProtocolMessage {
    ProtocolMessage::new(action::CLOSE)
}

pub fn build_heartbeat_msg(id: Option<String>) -> ProtocolMessage {
    ProtocolMessage {
        action: action::HEARTBEAT,
        id,
        ..Default::default()
    }
}

pub fn build_auth_msg(access_token: String) -> ProtocolMessage {
    ProtocolMessage {
        action: action::AUTH,
        auth: Some(AuthDetails { access_token }),
        ..Default::default()
    }
}

pub fn build_message_msg(channel: &str, messages: Vec<WireMessage>) -> ProtocolMessage {
    ProtocolMessage {
        action: action::MESSAGE,
        channel: Some(channel.to_string()),
        messages: Some(messages),
        ..Default::default()
    }
}

pub fn build_presence_msg(channel: &str, presence: Vec<WirePresenceMessage>) -> ProtocolMessage {
    ProtocolMessage {
        action: action::PRESENCE,
        channel: Some(channel.to_string()),
        presence: Some(presence),
        ..Default::default()
    }
}

pub fn build_annotation_msg(channel: &str, annotations: Vec<WireAnnotation>) -> ProtocolMessage {
    ProtocolMessage {
        action: action::ANNOTATION,
        channel: Some(channel.to_string()),
        annotations: Some(annotations),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &ProtocolMessage) -> ProtocolMessage {
        let data = encode_msg(msg, Format::MsgPack).unwrap();
        decode_msg(&data, Format::MsgPack).unwrap()
    }

    #[test]
    fn encode_decode_attach_with_params() {
        let mut params = HashMap::new();
        params.insert("rewind".to_string(), "2m".to_string());
        let msg = build_attach_msg("run:uuid-123", Some(params), None, flags::MODE_SUBSCRIBE, false);
        let decoded = round_trip(&msg);
        assert_eq!(decoded.action, action::ATTACH);
        assert_eq!(decoded.channel.as_deref(), Some("run:uuid-123"));
        assert_eq!(
            decoded
                .params
                .as_ref()
                .and_then(|p| p.get("rewind"))
                .map(String::as_str),
            Some("2m")
        );
    }

    #[test]
    fn encode_decode_auth() {
        let decoded = round_trip(&build_auth_msg("my-token".to_string()));
        assert_eq!(decoded.action, action::AUTH);
        assert_eq!(
            decoded.auth.as_ref().map(|a| a.access_token.as_str()),
            Some("my-token")
        );
    }

    #[test]
    fn connected_becomes_typed() {
        let msg = ProtocolMessage {
            action: action::CONNECTED,
            connection_id: Some("abc123".to_string()),
            connection_details: Some(ConnectionDetails {
                connection_key: Some("abc123!key".to_string()),
                connection_state_ttl: Some(120000),
                max_idle_interval: Some(15000),
                server_id: Some("frontend.0".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let Inbound::Connected(c) = Inbound::try_from(round_trip(&msg)).unwrap() else {
            panic!("expected CONNECTED");
        };
        assert_eq!(c.connection_id, "abc123");
        assert_eq!(c.connection_key.as_deref(), Some("abc123!key"));
        assert_eq!(c.details.max_idle_interval, Some(15000));
        assert!(c.error.is_none());
    }

    #[test]
    fn legacy_top_level_connection_key() {
        let msg = ProtocolMessage {
            action: action::CONNECTED,
            connection_id: Some("c".to_string()),
            connection_key: Some("c!legacy".to_string()),
            ..Default::default()
        };
        let Inbound::Connected(c) = Inbound::try_from(msg).unwrap() else {
            panic!("expected CONNECTED");
        };
        assert_eq!(c.connection_key.as_deref(), Some("c!legacy"));
    }

    #[test]
    fn binary_data_survives_msgpack() {
        let msg = build_message_msg(
            "bin",
            vec![WireMessage {
                name: Some("blob".to_string()),
                data: WireData::Binary(vec![0, 159, 146, 150]),
                ..Default::default()
            }],
        );
        let decoded = round_trip(&msg);
        let data = decoded
            .messages
            .as_ref()
            .and_then(|m| m.first())
            .map(|m| m.data.clone());
        assert_eq!(data, Some(WireData::Binary(vec![0, 159, 146, 150])));
    }

    #[test]
    fn structured_data_decodes_as_json() {
        let msg = build_message_msg(
            "json",
            vec![WireMessage {
                data: WireData::Json(serde_json::json!({"runId": "uuid-123"})),
                ..Default::default()
            }],
        );
        let decoded = round_trip(&msg);
        let first = decoded.messages.unwrap().into_iter().next().unwrap();
        assert_eq!(first.data, WireData::Json(serde_json::json!({"runId": "uuid-123"})));
    }

    #[test]
    fn json_format_round_trip() {
        let msg = ProtocolMessage {
            action: action::NACK,
            msg_serial: Some(4),
            count: Some(2),
            error: Some(ErrorInfo::new(40160, 401, "denied")),
            ..Default::default()
        };
        let bytes = encode_msg(&msg, Format::Json).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"msgSerial\":4"));
        let Inbound::Nack {
            msg_serial,
            count,
            error,
        } = Inbound::try_from(decode_msg(&bytes, Format::Json).unwrap()).unwrap()
        else {
            panic!("expected NACK");
        };
        assert_eq!((msg_serial, count), (4, 2));
        assert_eq!(error.map(|e| e.code), Some(40160));
    }

    #[test]
    fn duplicate_keys_keep_last() {
        let value = rmpv::Value::Map(vec![
            (rmpv::Value::from("action"), rmpv::Value::from(15)),
            (rmpv::Value::from("channel"), rmpv::Value::from("a")),
            (rmpv::Value::from("channel"), rmpv::Value::from("b")),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        let decoded = decode_msg(&buf, Format::MsgPack).unwrap();
        assert_eq!(decoded.channel.as_deref(), Some("b"));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_msg(&[0xc1], Format::MsgPack).unwrap_err();
        assert!(matches!(err, Error::MsgpackDecode(_)));
    }

    #[test]
    fn channel_actions_require_channel() {
        let err = Inbound::try_from(ProtocolMessage::new(action::ATTACHED)).unwrap_err();
        assert_eq!(err.code, 40000);
        let sync = ProtocolMessage {
            action: action::SYNC,
            channel: Some("p".to_string()),
            channel_serial: Some("serial:cursor".to_string()),
            ..Default::default()
        };
        let inbound = Inbound::try_from(sync).unwrap();
        assert_eq!(inbound.channel(), Some("p"));
        assert_eq!(inbound.name(), "SYNC");
    }

    #[test]
    fn unknown_action_is_other() {
        assert_eq!(
            Inbound::try_from(ProtocolMessage::new(99)).unwrap(),
            Inbound::Other(99)
        );
    }

    #[test]
    fn build_attach_msg_resume_flag() {
        let msg = build_attach_msg("my-channel", None, Some("serial-abc"), flags::MODE_SUBSCRIBE, true);
        assert_eq!(msg.channel_serial.as_deref(), Some("serial-abc"));
        assert!(msg.has_flag(flags::ATTACH_RESUME));
        assert!(msg.has_flag(flags::MODE_SUBSCRIBE));

        let msg = build_attach_msg("my-channel", None, None, 0, false);
        assert_eq!(msg.flags, None);
        assert!(msg.params.is_none());
    }

    #[test]
    fn flag_constants() {
        assert_eq!(flags::MODE_SUBSCRIBE, 1 << 18);
        assert_eq!(flags::ATTACH_RESUME, 32);
        assert_eq!(flags::RESUMED, 4);
        assert!(ack_required(action::PRESENCE));
        assert!(!ack_required(action::ATTACH));
    }
}
