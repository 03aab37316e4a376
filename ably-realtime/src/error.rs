//! Error types: the wire-level [`ErrorInfo`] and the crate-level [`Error`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

use crate::types::{ChannelState, ConnectionState};

/// A boxed error type for user-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

pub mod error_code {
    pub const BAD_REQUEST: i32 = 40000;
    pub const INVALID_CLIENT_ID: i32 = 40012;
    pub const UNSUPPORTED_ENCODING: i32 = 40013;
    pub const DELTA_DECODE_FAILED: i32 = 40018;
    pub const DELTA_DECODER_MISSING: i32 = 40019;
    pub const INVALID_CREDENTIALS: i32 = 40100;
    pub const INCOMPATIBLE_CREDENTIALS: i32 = 40102;
    pub const TOKEN_ERROR_START: i32 = 40140;
    pub const TOKEN_ERROR_END: i32 = 40149;
    pub const CAPABILITY_DENIED: i32 = 40160;
    pub const CLIENT_ID_MISMATCH: i32 = 40170;
    pub const TOKEN_NOT_RENEWABLE: i32 = 40171;
    pub const UNKNOWN_CHANNEL: i32 = 50001;
    pub const UNKNOWN_CONNECTION: i32 = 50002;
    pub const TIMEOUT: i32 = 50003;
    pub const FAILED: i32 = 80000;
    pub const SUSPENDED: i32 = 80002;
    pub const DISCONNECTED: i32 = 80003;
    pub const RESUME_FAILED: i32 = 80008;
    pub const SUPERSEDED_TRANSPORT: i32 = 80016;
    pub const CLOSED: i32 = 80017;
    pub const AUTH_CALLBACK_FAILED: i32 = 80019;
    pub const CHANNEL_OPERATION_FAILED: i32 = 90000;
    pub const CHANNEL_INVALID_STATE: i32 = 90001;
    pub const CHANNEL_TIMEOUT: i32 = 90007;
    pub const PRESENCE_REENTER_FAILED: i32 = 91004;
    pub const PRESENCE_OUT_OF_SYNC: i32 = 91005;
    pub const ANNOTATION_MODE_MISSING: i32 = 93001;
}

/// Connection error codes that stay retriable even when paired with a 4xx status.
const CONNECTION_ERROR_CODES: &[i32] = &[
    error_code::DISCONNECTED,
    error_code::SUSPENDED,
    error_code::FAILED,
    error_code::CLOSED,
    error_code::UNKNOWN_CONNECTION,
    error_code::UNKNOWN_CHANNEL,
];

// ---------------------------------------------------------------------------
// ErrorInfo
// ---------------------------------------------------------------------------

/// An Ably error as carried on the wire and surfaced in state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: i32,
    pub status_code: Option<i32>,
    pub message: String,
    pub href: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: i32, status_code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code: Some(status_code),
            message: message.into(),
            href: None,
        }
    }

    /// Token errors (40140..=40149) can be healed by fetching a new token.
    pub fn is_token_error(&self) -> bool {
        (error_code::TOKEN_ERROR_START..=error_code::TOKEN_ERROR_END).contains(&self.code)
    }

    /// An error is retriable when it has no status code, is a server error
    /// (5xx), or carries a connection error code even at 4xx.
    pub fn is_retriable(&self) -> bool {
        match self.status_code {
            None => true,
            Some(sc) if sc >= 500 => true,
            Some(_) => CONNECTION_ERROR_CODES.contains(&self.code),
        }
    }

    pub(crate) fn is_server_error(&self) -> bool {
        self.status_code.is_some_and(|sc| sc >= 500)
    }

    // ---- connection errors ----

    pub(crate) fn disconnected() -> Self {
        Self::new(
            error_code::DISCONNECTED,
            400,
            "Connection to server temporarily unavailable",
        )
    }

    pub(crate) fn suspended() -> Self {
        Self::new(
            error_code::SUSPENDED,
            400,
            "Connection to server unavailable",
        )
    }

    pub(crate) fn failed() -> Self {
        Self::new(error_code::FAILED, 400, "Connection failed or disconnected by server")
    }

    pub(crate) fn closing() -> Self {
        Self::new(error_code::CLOSED, 400, "Connection closing")
    }

    pub(crate) fn closed() -> Self {
        Self::new(error_code::CLOSED, 400, "Connection closed")
    }

    pub(crate) fn unknown_connection() -> Self {
        Self::new(
            error_code::UNKNOWN_CONNECTION,
            500,
            "Internal connection error",
        )
    }

    pub(crate) fn unknown_channel() -> Self {
        Self::new(error_code::UNKNOWN_CHANNEL, 500, "Internal channel error")
    }

    /// Default reason attached to a transition into `state`, if any.
    pub(crate) fn for_connection_state(state: ConnectionState) -> Option<Self> {
        match state {
            ConnectionState::Disconnected => Some(Self::disconnected()),
            ConnectionState::Suspended => Some(Self::suspended()),
            ConnectionState::Failed => Some(Self::failed()),
            ConnectionState::Closing => Some(Self::closing()),
            ConnectionState::Closed => Some(Self::closed()),
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Connected => None,
        }
    }

    // ---- channel errors ----

    pub(crate) fn channel_invalid_state(channel: &str, state: ChannelState) -> Self {
        Self::new(
            error_code::CHANNEL_INVALID_STATE,
            400,
            format!("Channel operation failed as channel state is {state} (channel = {channel})"),
        )
    }

    pub(crate) fn channel_operation_failed(status_code: i32, message: impl Into<String>) -> Self {
        Self::new(error_code::CHANNEL_OPERATION_FAILED, status_code, message)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code={}", self.message, self.code)?;
        if let Some(sc) = self.status_code {
            write!(f, ", status={sc}")?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for ErrorInfo {}

// ---------------------------------------------------------------------------
// Crate error
// ---------------------------------------------------------------------------

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Ably error: {0}")]
    Ably(ErrorInfo),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("Token exchange HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgpackDecode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Token fetch failed: {0}")]
    TokenFetch(BoxError),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("client has been shut down")]
    Closed,
}

impl Error {
    /// The Ably error code, when this error carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Ably(info) => Some(info.code),
            _ => None,
        }
    }

    /// Collapse into the [`ErrorInfo`] surfaced to state-change listeners.
    pub(crate) fn into_error_info(self) -> ErrorInfo {
        match self {
            Error::Ably(info) => info,
            Error::WebSocket(e) => {
                if let tungstenite::Error::Http(resp) = e.as_ref() {
                    ErrorInfo::new(
                        error_code::DISCONNECTED,
                        i32::from(resp.status().as_u16()),
                        format!("WebSocket handshake rejected: {}", resp.status()),
                    )
                } else {
                    ErrorInfo {
                        code: error_code::DISCONNECTED,
                        status_code: None,
                        message: format!("WebSocket error: {e}"),
                        href: None,
                    }
                }
            }
            Error::Http(e) => ErrorInfo {
                code: error_code::AUTH_CALLBACK_FAILED,
                status_code: e.status().map(|s| i32::from(s.as_u16())).or(Some(401)),
                message: format!("Token request failed: {e}"),
                href: None,
            },
            Error::TokenFetch(e) => ErrorInfo::new(
                error_code::AUTH_CALLBACK_FAILED,
                401,
                format!("Token callback failed: {e}"),
            ),
            other => ErrorInfo::new(error_code::BAD_REQUEST, 400, other.to_string()),
        }
    }
}

impl From<ErrorInfo> for Error {
    fn from(e: ErrorInfo) -> Self {
        Error::Ably(e)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(code: i32, status_code: Option<i32>) -> ErrorInfo {
        ErrorInfo {
            code,
            status_code,
            message: String::new(),
            href: None,
        }
    }

    #[test]
    fn is_retriable_no_status_code() {
        assert!(err(12345, None).is_retriable());
    }

    #[test]
    fn is_retriable_server_error() {
        assert!(err(50000, Some(500)).is_retriable());
    }

    #[test]
    fn is_retriable_connection_error_code_with_4xx() {
        assert!(err(80003, Some(400)).is_retriable());
    }

    #[test]
    fn auth_errors_are_not_retriable() {
        assert!(!err(40142, Some(401)).is_retriable());
        assert!(!err(40160, Some(401)).is_retriable());
        assert!(!err(42910, Some(429)).is_retriable());
    }

    #[test]
    fn token_error_range() {
        assert!(err(40140, Some(401)).is_token_error());
        assert!(err(40149, Some(401)).is_token_error());
        assert!(!err(40150, Some(401)).is_token_error());
        assert!(!err(40100, Some(401)).is_token_error());
    }

    #[test]
    fn connection_state_reasons() {
        let suspended = ErrorInfo::for_connection_state(ConnectionState::Suspended).unwrap();
        assert_eq!(suspended.code, 80002);
        let closed = ErrorInfo::for_connection_state(ConnectionState::Closed).unwrap();
        assert_eq!(closed.code, 80017);
        assert!(ErrorInfo::for_connection_state(ConnectionState::Connected).is_none());
    }

    #[test]
    fn display_includes_code_and_status() {
        let e = ErrorInfo::new(90001, 400, "bad state");
        assert_eq!(e.to_string(), "bad state (code=90001, status=400)");
    }

    #[test]
    fn error_code_accessor() {
        let e: Error = ErrorInfo::new(40019, 400, "missing").into();
        assert_eq!(e.code(), Some(40019));
        assert_eq!(Error::Closed.code(), None);
    }
}
