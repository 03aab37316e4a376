//! Client and channel configuration.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DeltaDecoder;
use crate::crypto::CipherParams;
use crate::error::{BoxError, ErrorInfo, error_code};
use crate::protocol::{Format, flags};
use crate::types::TokenRequest;

pub(crate) const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";
pub(crate) const DEFAULT_REST_HOST: &str = "rest.ably.io";
pub(crate) const DEFAULT_FALLBACK_HOSTS: &[&str] = &[
    "a.ably-realtime.com",
    "b.ably-realtime.com",
    "c.ably-realtime.com",
    "d.ably-realtime.com",
    "e.ably-realtime.com",
];
pub(crate) const WEB_SOCKET: &str = "web_socket";

/// Future returned by an auth callback.
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<TokenRequest, BoxError>> + Send>>;

/// Produces a signed [`TokenRequest`] on demand (typically by calling your server).
pub type AuthCallback = Arc<dyn Fn() -> TokenFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Protocol timers. Expressed in milliseconds when (de)serialised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    #[serde(with = "duration_ms")]
    pub disconnected_retry_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub suspended_retry_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub channel_retry_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub realtime_request_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub preference_connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connection_state_ttl: Duration,
    /// Used until the server supplies its own value in CONNECTED.
    #[serde(with = "duration_ms")]
    pub max_idle_interval: Duration,
    /// How long a fallback host that reached CONNECTED stays preferred.
    #[serde(with = "duration_ms")]
    pub fallback_retry_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub web_socket_connect_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            disconnected_retry_timeout: Duration::from_millis(15_000),
            suspended_retry_timeout: Duration::from_millis(30_000),
            channel_retry_timeout: Duration::from_millis(15_000),
            realtime_request_timeout: Duration::from_millis(10_000),
            preference_connect_timeout: Duration::from_millis(6_000),
            connection_state_ttl: Duration::from_millis(120_000),
            max_idle_interval: Duration::from_millis(15_000),
            fallback_retry_timeout: Duration::from_millis(600_000),
            web_socket_connect_timeout: Duration::from_millis(10_000),
        }
    }
}

impl Timeouts {
    fn all(&self) -> [(&'static str, Duration); 9] {
        [
            ("disconnectedRetryTimeout", self.disconnected_retry_timeout),
            ("suspendedRetryTimeout", self.suspended_retry_timeout),
            ("channelRetryTimeout", self.channel_retry_timeout),
            ("realtimeRequestTimeout", self.realtime_request_timeout),
            ("preferenceConnectTimeout", self.preference_connect_timeout),
            ("connectionStateTtl", self.connection_state_ttl),
            ("maxIdleInterval", self.max_idle_interval),
            ("fallbackRetryTimeout", self.fallback_retry_timeout),
            ("webSocketConnectTimeout", self.web_socket_connect_timeout),
        ]
    }
}

// ---------------------------------------------------------------------------
// ClientOptions
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
    /// API key in `keyName:keySecret` form.
    pub key: Option<String>,
    /// A static token. Cannot be renewed.
    pub token: Option<String>,
    #[serde(skip)]
    pub auth_callback: Option<AuthCallback>,
    pub client_id: Option<String>,

    pub realtime_host: Option<String>,
    pub rest_host: Option<String>,
    pub fallback_hosts: Option<Vec<String>>,
    pub port: Option<u16>,
    pub tls: bool,

    pub auto_connect: bool,
    pub queue_messages: bool,
    pub echo_messages: bool,
    /// MessagePack when true, JSON text frames otherwise.
    pub use_binary_protocol: bool,
    /// Recovery key from a previous connection's `recovery_key()`.
    pub recover: Option<String>,
    /// Transport names in order of preference; the first is the base transport.
    pub transports: Vec<String>,
    pub max_fallback_retries: usize,

    pub timeouts: Timeouts,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            auth_callback: None,
            client_id: None,
            realtime_host: None,
            rest_host: None,
            fallback_hosts: None,
            port: None,
            tls: true,
            auto_connect: true,
            queue_messages: true,
            echo_messages: true,
            use_binary_protocol: true,
            recover: None,
            transports: vec![WEB_SOCKET.to_string()],
            max_fallback_retries: 3,
            timeouts: Timeouts::default(),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("auth_callback", &self.auth_callback.is_some())
            .field("client_id", &self.client_id)
            .field("realtime_host", &self.realtime_host)
            .field("rest_host", &self.rest_host)
            .field("fallback_hosts", &self.fallback_hosts)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("auto_connect", &self.auto_connect)
            .field("queue_messages", &self.queue_messages)
            .field("echo_messages", &self.echo_messages)
            .field("use_binary_protocol", &self.use_binary_protocol)
            .field("recover", &self.recover.is_some())
            .field("transports", &self.transports)
            .field("max_fallback_retries", &self.max_fallback_retries)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl ClientOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn with_auth_callback<F, Fut>(callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TokenRequest, BoxError>> + Send + 'static,
    {
        Self {
            auth_callback: Some(Arc::new(move || Box::pin(callback()) as TokenFuture)),
            ..Default::default()
        }
    }

    /// Rejects configurations that can never connect.
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.key.is_none() && self.token.is_none() && self.auth_callback.is_none() {
            return Err(ErrorInfo::new(
                error_code::CAPABILITY_DENIED,
                401,
                "No authentication options provided; need one of: key, token or auth_callback",
            ));
        }
        if let Some(key) = &self.key
            && split_key(key).is_none()
        {
            return Err(ErrorInfo::new(
                error_code::INVALID_CREDENTIALS,
                401,
                "Invalid key; expected keyName:keySecret",
            ));
        }
        if self.client_id.as_deref() == Some("*") {
            return Err(ErrorInfo::new(
                error_code::INVALID_CLIENT_ID,
                400,
                "Can't use \"*\" as a clientId as that string is reserved",
            ));
        }
        if self.transports.is_empty() {
            return Err(ErrorInfo::new(
                error_code::BAD_REQUEST,
                400,
                "At least one transport must be configured",
            ));
        }
        for (name, value) in self.timeouts.all() {
            if value.is_zero() {
                return Err(ErrorInfo::new(
                    error_code::BAD_REQUEST,
                    400,
                    format!("{name} must be greater than zero"),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn realtime_host(&self) -> &str {
        self.realtime_host.as_deref().unwrap_or(DEFAULT_REALTIME_HOST)
    }

    /// A custom realtime host doubles as the REST host unless one is given.
    pub(crate) fn rest_host(&self) -> String {
        match (&self.rest_host, &self.realtime_host) {
            (Some(rest), _) => rest.clone(),
            (None, Some(realtime)) if realtime != DEFAULT_REALTIME_HOST => realtime.clone(),
            _ => DEFAULT_REST_HOST.to_string(),
        }
    }

    /// Fallbacks apply only to the default host unless configured explicitly.
    pub(crate) fn fallback_hosts(&self) -> Vec<String> {
        match &self.fallback_hosts {
            Some(hosts) => hosts.clone(),
            None if self.realtime_host.is_none() => DEFAULT_FALLBACK_HOSTS
                .iter()
                .map(|h| (*h).to_string())
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn format(&self) -> Format {
        Format::from_binary(self.use_binary_protocol)
    }

    pub(crate) fn key_name(&self) -> Option<&str> {
        self.key.as_deref().and_then(split_key).map(|(name, _)| name)
    }
}

pub(crate) fn split_key(key: &str) -> Option<(&str, &str)> {
    let (name, secret) = key.split_once(':')?;
    if name.is_empty() || secret.is_empty() || !name.contains('.') {
        return None;
    }
    Some((name, secret))
}

// ---------------------------------------------------------------------------
// ChannelOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelMode {
    Presence,
    Publish,
    Subscribe,
    PresenceSubscribe,
    AnnotationPublish,
    AnnotationSubscribe,
}

impl ChannelMode {
    pub(crate) fn flag(self) -> i32 {
        match self {
            Self::Presence => flags::MODE_PRESENCE,
            Self::Publish => flags::MODE_PUBLISH,
            Self::Subscribe => flags::MODE_SUBSCRIBE,
            Self::PresenceSubscribe => flags::MODE_PRESENCE_SUBSCRIBE,
            Self::AnnotationPublish => flags::MODE_ANNOTATION_PUBLISH,
            Self::AnnotationSubscribe => flags::MODE_ANNOTATION_SUBSCRIBE,
        }
    }

    pub(crate) fn all() -> [ChannelMode; 6] {
        [
            Self::Presence,
            Self::Publish,
            Self::Subscribe,
            Self::PresenceSubscribe,
            Self::AnnotationPublish,
            Self::AnnotationSubscribe,
        ]
    }

    pub(crate) fn from_flags(f: i32) -> Vec<ChannelMode> {
        Self::all()
            .into_iter()
            .filter(|m| f & m.flag() != 0)
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct ChannelOptions {
    /// Sent as `params` on ATTACH (e.g. `rewind`).
    pub params: HashMap<String, String>,
    /// Requested modes; the server default applies when empty.
    pub modes: Vec<ChannelMode>,
    pub cipher: Option<CipherParams>,
    /// Enables `vcdiff` deltas on this channel.
    pub delta: Option<Arc<dyn DeltaDecoder>>,
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("params", &self.params)
            .field("modes", &self.modes)
            .field("cipher", &self.cipher.as_ref().map(CipherParams::algorithm))
            .field("delta", &self.delta.is_some())
            .finish()
    }
}

impl ChannelOptions {
    pub fn with_cipher(cipher: CipherParams) -> Self {
        Self {
            cipher: Some(cipher),
            ..Default::default()
        }
    }

    pub(crate) fn mode_flags(&self) -> i32 {
        self.modes.iter().fold(0, |acc, m| acc | m.flag())
    }

    /// Params as sent on ATTACH, including the delta request.
    pub(crate) fn attach_params(&self) -> Option<HashMap<String, String>> {
        let mut params = self.params.clone();
        if self.delta.is_some() {
            params
                .entry("delta".to_string())
                .or_insert_with(|| "vcdiff".to_string());
        }
        if params.is_empty() { None } else { Some(params) }
    }
}
