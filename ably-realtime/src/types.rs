//! Public value types: payloads, messages, presence, states and state changes.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

// ---------------------------------------------------------------------------
// Auth tokens
// ---------------------------------------------------------------------------

/// Signed token request, usually minted by your own server.
///
/// Your server creates this using `client.auth.createTokenRequest()` and
/// returns it to the client. The client then exchanges it with Ably's REST API
/// for an actual token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub key_name: String,
    pub timestamp: i64,
    pub nonce: String,
    pub mac: String,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Token issued by the REST token endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub token: String,
    #[serde(default)]
    pub expires: i64,
    #[serde(default)]
    pub issued: i64,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// An application payload, before encoding or after decoding.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Data {
    #[default]
    None,
    String(String),
    Binary(Vec<u8>),
    /// A JSON object or array; sent with the `json` encoding.
    Json(serde_json::Value),
}

impl Data {
    pub fn is_none(&self) -> bool {
        matches!(self, Data::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Data::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Data::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::String(s.to_string())
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::String(s)
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Data::Binary(b)
    }
}

impl From<&[u8]> for Data {
    fn from(b: &[u8]) -> Self {
        Data::Binary(b.to_vec())
    }
}

impl From<serde_json::Value> for Data {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Data::None,
            serde_json::Value::String(s) => Data::String(s),
            other => Data::Json(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message published to or received from a channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: Option<String>,
    /// Event name (e.g. "job", "status").
    pub name: Option<String>,
    pub data: Data,
    /// Transforms still applied to `data`; `None` when fully decoded.
    pub encoding: Option<String>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    /// Server timestamp (milliseconds since epoch).
    pub timestamp: Option<i64>,
    pub extras: Option<serde_json::Value>,
    pub serial: Option<String>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: impl Into<Data>) -> Self {
        Self {
            name: Some(name.into()),
            data: data.into(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceAction {
    Absent,
    #[default]
    Present,
    Enter,
    Leave,
    Update,
}

impl PresenceAction {
    pub(crate) fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Absent),
            1 => Some(Self::Present),
            2 => Some(Self::Enter),
            3 => Some(Self::Leave),
            4 => Some(Self::Update),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> i32 {
        match self {
            Self::Absent => 0,
            Self::Present => 1,
            Self::Enter => 2,
            Self::Leave => 3,
            Self::Update => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Present => "present",
            Self::Enter => "enter",
            Self::Leave => "leave",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A presence event for one member of a channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceMessage {
    /// `{connectionId}:{msgSerial}:{index}` for server-originated events.
    pub id: Option<String>,
    pub action: PresenceAction,
    pub client_id: String,
    pub connection_id: String,
    pub data: Data,
    pub encoding: Option<String>,
    pub timestamp: i64,
    pub extras: Option<serde_json::Value>,
}

impl PresenceMessage {
    /// Key of the member this event applies to.
    pub fn member_key(&self) -> String {
        format!("{}:{}", self.client_id, self.connection_id)
    }

    /// Synthesized events (e.g. leaves generated by the service) carry an id
    /// that does not start with their connection id.
    pub fn is_synthesized(&self) -> bool {
        match &self.id {
            Some(_) if self.connection_id.is_empty() => true,
            Some(id) => !id.starts_with(self.connection_id.as_str()),
            None => true,
        }
    }

    /// Parses the `(msgSerial, index)` ordering pair from the id.
    pub fn parse_id(&self) -> Option<(i64, i64)> {
        let id = self.id.as_deref()?;
        let mut parts = id.rsplitn(3, ':');
        let index = parts.next()?.parse().ok()?;
        let msg_serial = parts.next()?.parse().ok()?;
        parts.next()?;
        Some((msg_serial, index))
    }
}

// ---------------------------------------------------------------------------
// Annotations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnotationAction {
    #[default]
    Create,
    Delete,
}

impl AnnotationAction {
    pub(crate) fn from_code(code: i32) -> Self {
        if code == 1 { Self::Delete } else { Self::Create }
    }

    pub(crate) fn code(self) -> i32 {
        match self {
            Self::Create => 0,
            Self::Delete => 1,
        }
    }
}

/// An annotation attached to a previously published message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotation {
    pub id: Option<String>,
    pub action: AnnotationAction,
    /// Serial of the annotated message.
    pub message_serial: String,
    /// Annotation type, e.g. `"reaction:distinct.v1"`.
    pub kind: String,
    pub name: Option<String>,
    pub count: Option<i64>,
    pub data: Data,
    pub encoding: Option<String>,
    pub client_id: Option<String>,
    pub serial: Option<String>,
    pub timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Connection and channel states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Suspended => "suspended",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// Outbound messages may be queued while in this state.
    pub fn queue_events(self) -> bool {
        matches!(
            self,
            Self::Initialized | Self::Connecting | Self::Disconnected
        )
    }

    /// Outbound messages are sent immediately in this state.
    pub fn send_events(self) -> bool {
        self == Self::Connected
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Channels may be attached while the connection is in this state.
    pub fn is_active(self) -> bool {
        self.queue_events() || self.send_events()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Detached => "detached",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted on every connection state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorInfo>,
    /// Delay before the next automatic connection attempt, if one is scheduled.
    pub retry_in: Option<Duration>,
}

/// Emitted on every channel state transition, and as `update` when an
/// attached channel is re-attached without a state change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub resumed: bool,
    pub has_backlog: bool,
    pub reason: Option<ErrorInfo>,
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
