//! Transports carry protocol frames between the client and the service.
//!
//! A [`TransportFactory`] opens a connection and hands back its two halves.
//! `spawn` drives one connection in its own task and reports what happens
//! to the event loop, tagged with the transport id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, trace, warn};

use crate::auth::Credential;
use crate::error::{Error, ErrorInfo, error_code};
use crate::options::WEB_SOCKET;
use crate::protocol::{Format, ProtocolMessage, decode_msg, encode_msg};

const PROTOCOL_VERSION: &str = "5";
const AGENT_STRING: &str = concat!("ably-realtime-rs/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// How a new transport relates to earlier connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    Clean,
    /// Resume with the given connection key.
    Resume(String),
    /// Recover another client's connection from a recovery key.
    Recover(String),
    /// Join an existing connection as an upgrade.
    Upgrade(String),
}

/// Everything needed to open one transport.
#[derive(Debug, Clone)]
pub struct TransportParams {
    /// May carry its own `:port`.
    pub host: String,
    pub port: Option<u16>,
    pub tls: bool,
    pub format: Format,
    pub mode: ConnectMode,
    pub credential: Credential,
    pub client_id: Option<String>,
    pub echo: bool,
    pub connect_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Outbound half of an open transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, msg: &ProtocolMessage) -> Result<(), Error>;
    async fn close(&mut self);
}

/// Inbound half of an open transport. `None` means the peer closed cleanly.
#[async_trait]
pub trait FrameStream: Send {
    async fn recv(&mut self) -> Option<Result<ProtocolMessage, Error>>;
}

pub struct OpenTransport {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Name matched against `ClientOptions::transports`.
    fn name(&self) -> &str;
    async fn connect(&self, params: &TransportParams) -> Result<OpenTransport, Error>;
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

pub struct WebSocketFactory;

#[async_trait]
impl TransportFactory for WebSocketFactory {
    fn name(&self) -> &str {
        WEB_SOCKET
    }

    async fn connect(&self, params: &TransportParams) -> Result<OpenTransport, Error> {
        let url = build_ws_url(params)?;
        let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (write, read) = ws.split();
        Ok(OpenTransport {
            sink: Box::new(WsSink {
                write,
                format: params.format,
            }),
            stream: Box::new(WsSource {
                read,
                format: params.format,
            }),
        })
    }
}

struct WsSink {
    write: WsWrite,
    format: Format,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, msg: &ProtocolMessage) -> Result<(), Error> {
        let data = encode_msg(msg, self.format)?;
        let frame = match self.format {
            Format::MsgPack => tungstenite::Message::Binary(data.into()),
            Format::Json => tungstenite::Message::Text(String::from_utf8_lossy(&data).into_owned().into()),
        };
        self.write.send(frame).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.write.close().await;
    }
}

struct WsSource {
    read: WsRead,
    format: Format,
}

#[async_trait]
impl FrameStream for WsSource {
    async fn recv(&mut self) -> Option<Result<ProtocolMessage, Error>> {
        while let Some(frame) = self.read.next().await {
            let data = match frame {
                Ok(tungstenite::Message::Binary(data)) => data.to_vec(),
                Ok(tungstenite::Message::Text(text)) => text.as_bytes().to_vec(),
                Ok(tungstenite::Message::Close(_)) => return None,
                // Ignore ping, pong and raw frames
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            };
            match decode_msg(&data, self.format) {
                Ok(msg) => return Some(Ok(msg)),
                Err(e) => warn!("Failed to decode message: {e}"),
            }
        }
        None
    }
}

fn authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) if !host.contains(':') => format!("{host}:{port}"),
        _ => host.to_string(),
    }
}

pub(crate) fn build_ws_url(params: &TransportParams) -> Result<String, Error> {
    let scheme = if params.tls { "wss" } else { "ws" };
    let mut u = url::Url::parse(&format!("{scheme}://{}/", authority(&params.host, params.port)))?;
    {
        let mut q = u.query_pairs_mut();
        match &params.credential {
            Credential::Key(key) => q.append_pair("key", key),
            Credential::Token(token) => q.append_pair("access_token", token),
        };
        q.append_pair("format", params.format.as_str());
        q.append_pair("v", PROTOCOL_VERSION);
        q.append_pair("agent", AGENT_STRING);
        q.append_pair("heartbeats", "true");
        q.append_pair("echo", if params.echo { "true" } else { "false" });
        if let Some(client_id) = &params.client_id {
            q.append_pair("clientId", client_id);
        }
        match &params.mode {
            ConnectMode::Clean => {}
            ConnectMode::Resume(key) => {
                q.append_pair("resume", key);
            }
            ConnectMode::Recover(key) => {
                q.append_pair("recover", key);
            }
            ConnectMode::Upgrade(key) => {
                q.append_pair("upgrade", key);
            }
        }
    }
    Ok(u.to_string())
}

// ---------------------------------------------------------------------------
// Transport task
// ---------------------------------------------------------------------------

pub(crate) type TransportId = u64;

/// Progress of one transport as seen by the event loop.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Opened,
    Message(Box<ProtocolMessage>),
    Closed(Option<ErrorInfo>),
}

pub(crate) enum Outgoing {
    Frame(Box<ProtocolMessage>),
    Close,
}

/// Sender half used by the event loop to write to a spawned transport.
pub(crate) type TransportHandle = mpsc::UnboundedSender<Outgoing>;

/// Opens a transport in a new task. Every outcome, including a failure to
/// connect, is reported on `events`.
pub(crate) fn spawn(
    factory: Arc<dyn TransportFactory>,
    id: TransportId,
    params: TransportParams,
    events: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
) -> TransportHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(factory, id, params, events, rx));
    tx
}

async fn run(
    factory: Arc<dyn TransportFactory>,
    id: TransportId,
    params: TransportParams,
    events: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    let report = |event| {
        let _ = events.send((id, event));
    };

    let connect = tokio::time::timeout(params.connect_timeout, factory.connect(&params));
    let OpenTransport { mut sink, mut stream } = tokio::select! {
        result = connect => match result {
            Ok(Ok(open)) => open,
            Ok(Err(e)) => {
                warn!(id, host = %params.host, "transport connect failed: {e}");
                report(TransportEvent::Closed(Some(e.into_error_info())));
                return;
            }
            Err(_) => {
                warn!(id, host = %params.host, "transport connect timed out");
                report(TransportEvent::Closed(Some(ErrorInfo {
                    code: error_code::DISCONNECTED,
                    status_code: None,
                    message: "Timed out opening transport".to_string(),
                    href: None,
                })));
                return;
            }
        },
        // Abandoned before it opened.
        _ = wait_for_close(&mut outgoing) => return,
    };
    report(TransportEvent::Opened);

    loop {
        tokio::select! {
            frame = stream.recv() => match frame {
                Some(Ok(msg)) => {
                    trace!(id, action = msg.action, "frame received");
                    report(TransportEvent::Message(Box::new(msg)));
                }
                Some(Err(e)) => {
                    warn!(id, "WebSocket error: {e}");
                    report(TransportEvent::Closed(Some(e.into_error_info())));
                    return;
                }
                None => {
                    debug!(id, "transport stream ended");
                    report(TransportEvent::Closed(None));
                    return;
                }
            },
            cmd = outgoing.recv() => match cmd {
                Some(Outgoing::Frame(msg)) => {
                    if let Err(e) = sink.send(&msg).await {
                        warn!(id, "send failed: {e}");
                        report(TransportEvent::Closed(Some(e.into_error_info())));
                        return;
                    }
                }
                Some(Outgoing::Close) | None => {
                    sink.close().await;
                    return;
                }
            },
        }
    }
}

async fn wait_for_close(outgoing: &mut mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(cmd) = outgoing.recv().await {
        if matches!(cmd, Outgoing::Close) {
            return;
        }
    }
}
