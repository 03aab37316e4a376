//! Ably Pub/Sub Realtime SDK.
//!
//! A realtime client for the Ably protocol (version 5): one multiplexed
//! connection carrying any number of channels, with publish/subscribe,
//! presence and message annotations.
//!
//! # Features
//! - Basic (API key), static token and callback-driven token authentication
//! - MessagePack or JSON wire format over WebSocket
//! - Connection resume, recovery across clients and fallback hosts
//! - Transport upgrade and a remembered transport preference
//! - Channel attach/detach with automatic reattach and state tracking
//! - Presence with SYNC, re-entry after reattach, and member queries
//! - Payload encoding with AES-CBC encryption and pluggable delta decoding
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), ably_realtime::Error> {
//! use ably_realtime::{ClientOptions, ConnectionState, Realtime};
//!
//! let client = Realtime::new(ClientOptions::with_key("appId.keyId:secret"))?;
//! client.connection().when_state(ConnectionState::Connected).await;
//!
//! let channel = client.channels().get("my-channel");
//! channel
//!     .subscribe("greeting", |msg| println!("got: {:?}", msg.data))
//!     .await?;
//! channel.publish("greeting", "hello").await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod backoff;
mod channel;
mod codec;
mod connection;
mod crypto;
pub mod diagnostics;
mod emitter;
mod error;
mod options;
mod presence;
pub mod protocol;
mod realtime;
mod transport;
mod types;

pub use auth::Credential;
pub use backoff::retry_time;
pub use channel::ChannelSnapshot;
pub use codec::{DecodeError, DeltaDecoder};
pub use connection::ConnectionSnapshot;
pub use crypto::{ChannelCipher, CipherParams, IV_LENGTH, generate_random_key};
pub use emitter::{EventEmitter, EventFilter, ListenerId};
pub use error::{BoxError, Error, ErrorInfo, error_code};
pub use options::{AuthCallback, ChannelMode, ChannelOptions, ClientOptions, Timeouts, TokenFuture};
pub use presence::PresenceGetParams;
pub use realtime::{Annotations, Channel, Channels, Connection, Presence, Realtime};
pub use transport::{
    ConnectMode, FrameSink, FrameStream, OpenTransport, TransportFactory, TransportParams,
    WebSocketFactory,
};
pub use types::{
    Annotation, AnnotationAction, ChannelState, ChannelStateChange, ConnectionState,
    ConnectionStateChange, Data, Message, PresenceAction, PresenceMessage, TokenDetails,
    TokenRequest,
};
