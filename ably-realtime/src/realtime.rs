//! Public client: [`Realtime`] and the handles it hands out.
//!
//! All state lives in one event loop task. Handles send it commands over
//! an unbounded channel and wait for replies on oneshot channels; listeners
//! are invoked from the loop task.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::Auth;
use crate::channel::{
    ChannelCore, ChannelRegistry, ChannelShared, ChannelSnapshot, ChannelTimeouts,
    ConnectionContext, SharedChannels,
};
use crate::connection::{Completion, ConnectionManager, ConnectionShared, Effect, ManagerConfig, PingReply};
use crate::diagnostics::{DiagnosticCommand, Diagnostics};
use crate::emitter::{EventFilter, ListenerId};
use crate::error::{Error, ErrorInfo, error_code};
use crate::options::{ChannelMode, ChannelOptions, ClientOptions};
use crate::presence::{PendingGet, PresenceGetParams};
use crate::transport::{self, Outgoing, TransportEvent, TransportFactory, TransportHandle, TransportId, WebSocketFactory};
use crate::types::{
    Annotation, ChannelState, ChannelStateChange, ConnectionState, ConnectionStateChange, Data,
    Message, PresenceAction, PresenceMessage, TokenDetails,
};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) enum Command {
    Connect,
    Close,
    Ping(PingReply),
    RecoveryKey(oneshot::Sender<Option<String>>),
    Ensure {
        shared: Arc<ChannelShared>,
        options: Option<Box<ChannelOptions>>,
    },
    Attach {
        shared: Arc<ChannelShared>,
        completion: Completion,
    },
    Detach {
        shared: Arc<ChannelShared>,
        completion: Completion,
    },
    Publish {
        shared: Arc<ChannelShared>,
        messages: Vec<Message>,
        completion: Completion,
    },
    Annotate {
        shared: Arc<ChannelShared>,
        annotation: Box<Annotation>,
        completion: Completion,
    },
    Presence {
        shared: Arc<ChannelShared>,
        action: PresenceAction,
        client_id: Option<String>,
        data: Data,
        completion: Completion,
    },
    PresenceGet {
        shared: Arc<ChannelShared>,
        request: PendingGet,
    },
    SetOptions {
        shared: Arc<ChannelShared>,
        options: Box<ChannelOptions>,
        completion: Completion,
    },
    Release(String),
    Diagnostic(DiagnosticCommand),
}

type CommandSender = mpsc::UnboundedSender<Command>;

fn send(commands: &CommandSender, command: Command) -> Result<(), Error> {
    commands.send(command).map_err(|_| Error::Closed)
}

/// Sends a command that completes with a [`Completion`] and waits for it.
async fn complete(
    commands: &CommandSender,
    build: impl FnOnce(Completion) -> Command,
) -> Result<(), Error> {
    let (tx, rx) = oneshot::channel();
    send(commands, build(Completion::reply(tx)))?;
    rx.await.map_err(|_| Error::Closed)?.map_err(Error::from)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct ClientInner {
    commands: CommandSender,
    connection: Arc<ConnectionShared>,
    channels: SharedChannels,
}

/// A realtime client. Cheap to clone; the connection is shared.
#[derive(Clone)]
pub struct Realtime {
    inner: Arc<ClientInner>,
}

impl Realtime {
    /// Creates a client using the WebSocket transport. Must be called from
    /// within a Tokio runtime. Connects immediately unless
    /// `auto_connect` is off.
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        Self::with_transports(options, vec![Arc::new(WebSocketFactory)])
    }

    /// Like [`Realtime::new`] with a custom set of transports. Factories are
    /// matched by name against `ClientOptions::transports`.
    pub fn with_transports(
        options: ClientOptions,
        factories: Vec<Arc<dyn TransportFactory>>,
    ) -> Result<Self, Error> {
        options.validate()?;
        let connection = Arc::new(ConnectionShared::new());
        let channels = SharedChannels::default();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();

        let timeouts = ChannelTimeouts {
            request: options.timeouts.realtime_request_timeout,
            retry: options.timeouts.channel_retry_timeout,
        };
        let event_loop = EventLoop {
            manager: ConnectionManager::new(
                ManagerConfig::from_options(&options),
                Arc::clone(&connection),
                options.recover.as_deref(),
            ),
            registry: ChannelRegistry::new(Arc::clone(&channels), timeouts),
            auth: Auth::new(&options),
            channels: Arc::clone(&channels),
            factories: factories
                .into_iter()
                .map(|f| (f.name().to_string(), f))
                .collect(),
            transports: HashMap::new(),
            commands: command_rx,
            transport_tx,
            transport_rx,
            auth_tx,
            auth_rx,
        };
        tokio::spawn(event_loop.run());

        if options.auto_connect {
            send(&commands, Command::Connect)?;
        }
        Ok(Self {
            inner: Arc::new(ClientInner {
                commands,
                connection,
                channels,
            }),
        })
    }

    pub fn connection(&self) -> Connection {
        Connection {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn channels(&self) -> Channels {
        Channels {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn connect(&self) {
        self.connection().connect();
    }

    pub fn close(&self) {
        self.connection().close();
    }

    /// Inspection and fault-injection hooks for tests.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(self.inner.commands.clone())
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ClientInner>,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.snapshot().state
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.connection.snapshot().error_reason
    }

    pub fn id(&self) -> Option<String> {
        self.inner.connection.snapshot().id
    }

    pub fn key(&self) -> Option<String> {
        self.inner.connection.snapshot().key
    }

    /// Client id assigned by the service, or the configured one.
    pub fn client_id(&self) -> Option<String> {
        self.inner.connection.snapshot().client_id
    }

    pub fn connect(&self) {
        if send(&self.inner.commands, Command::Connect).is_err() {
            warn!("connect requested after the client task ended");
        }
    }

    pub fn close(&self) {
        if send(&self.inner.commands, Command::Close).is_err() {
            warn!("close requested after the client task ended");
        }
    }

    /// Listens for state changes; events are state names plus `"update"`.
    pub fn on<F>(&self, filter: impl Into<EventFilter>, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.inner.connection.events.on(filter, listener)
    }

    pub fn once<F>(&self, filter: impl Into<EventFilter>, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.inner.connection.events.once(filter, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.connection.events.off(id)
    }

    /// Resolves once the connection is in `target`, immediately if it already is.
    pub async fn when_state(&self, target: ConnectionState) -> Option<ConnectionStateChange> {
        let (tx, rx) = oneshot::channel();
        self.inner.connection.events.when_state(
            target.as_str(),
            self.state().as_str(),
            move |change: Option<&ConnectionStateChange>| {
                let _ = tx.send(change.cloned());
            },
        );
        rx.await.ok().flatten()
    }

    /// Round-trip time of a HEARTBEAT.
    pub async fn ping(&self) -> Result<Duration, Error> {
        let (tx, rx) = oneshot::channel();
        send(&self.inner.commands, Command::Ping(tx))?;
        rx.await.map_err(|_| Error::Closed)?.map_err(Error::from)
    }

    /// Key that lets another client take over this connection with the
    /// `recover` option. `None` when there is nothing to recover.
    pub async fn recovery_key(&self) -> Result<Option<String>, Error> {
        let (tx, rx) = oneshot::channel();
        send(&self.inner.commands, Command::RecoveryKey(tx))?;
        rx.await.map_err(|_| Error::Closed)
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Channels {
    inner: Arc<ClientInner>,
}

impl Channels {
    /// Returns the channel, creating it on first use.
    pub fn get(&self, name: &str) -> Channel {
        self.get_inner(name, None)
    }

    /// Returns the channel and replaces its options.
    pub fn get_with_options(&self, name: &str, options: ChannelOptions) -> Channel {
        self.get_inner(name, Some(options))
    }

    fn get_inner(&self, name: &str, options: Option<ChannelOptions>) -> Channel {
        let (shared, created) = {
            let mut map = self
                .inner
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match map.get(name) {
                Some(shared) => (Arc::clone(shared), false),
                None => {
                    let shared = Arc::new(ChannelShared::new(name));
                    map.insert(name.to_string(), Arc::clone(&shared));
                    (shared, true)
                }
            }
        };
        if created || options.is_some() {
            let command = Command::Ensure {
                shared: Arc::clone(&shared),
                options: options.map(Box::new),
            };
            if send(&self.inner.commands, command).is_err() {
                warn!(channel = name, "channel created after the client task ended");
            }
        }
        Channel {
            inner: Arc::clone(&self.inner),
            shared,
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Detaches the channel if needed and drops it with all its listeners.
    pub fn release(&self, name: &str) {
        if send(&self.inner.commands, Command::Release(name.to_string())).is_err() {
            warn!(channel = name, "release requested after the client task ended");
        }
    }
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<ClientInner>,
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ChannelState {
        self.shared.snapshot().state
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.snapshot().error_reason
    }

    /// Serials, granted modes and params as of the last state change.
    pub fn properties(&self) -> ChannelSnapshot {
        self.shared.snapshot()
    }

    fn failed_error(&self) -> Option<Error> {
        (self.state() == ChannelState::Failed)
            .then(|| Error::Ably(ErrorInfo::channel_invalid_state(self.name(), ChannelState::Failed)))
    }

    // ---- state ----

    /// Listens for channel state changes; events are state names plus `"update"`.
    pub fn on<F>(&self, filter: impl Into<EventFilter>, listener: F) -> ListenerId
    where
        F: Fn(&ChannelStateChange) + Send + Sync + 'static,
    {
        self.shared.state_events.on(filter, listener)
    }

    pub fn once<F>(&self, filter: impl Into<EventFilter>, listener: F) -> ListenerId
    where
        F: Fn(&ChannelStateChange) + Send + Sync + 'static,
    {
        self.shared.state_events.once(filter, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.state_events.off(id)
    }

    pub async fn attach(&self) -> Result<(), Error> {
        let shared = Arc::clone(&self.shared);
        complete(&self.inner.commands, |completion| Command::Attach { shared, completion }).await
    }

    pub async fn detach(&self) -> Result<(), Error> {
        let shared = Arc::clone(&self.shared);
        complete(&self.inner.commands, |completion| Command::Detach { shared, completion }).await
    }

    pub async fn set_options(&self, options: ChannelOptions) -> Result<(), Error> {
        let shared = Arc::clone(&self.shared);
        complete(&self.inner.commands, |completion| Command::SetOptions {
            shared,
            options: Box::new(options),
            completion,
        })
        .await
    }

    // ---- messages ----

    pub async fn publish(&self, name: &str, data: impl Into<Data>) -> Result<(), Error> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    /// Publishes in a single protocol message; resolves when acknowledged.
    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<(), Error> {
        let shared = Arc::clone(&self.shared);
        complete(&self.inner.commands, |completion| Command::Publish {
            shared,
            messages,
            completion,
        })
        .await
    }

    /// Registers a message listener, filtered by message name, and attaches.
    pub async fn subscribe<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Result<ListenerId, Error>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if let Some(e) = self.failed_error() {
            return Err(e);
        }
        let id = self.shared.messages.on(filter, listener);
        if let Err(e) = self.attach().await {
            self.shared.messages.off(id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.messages.off(id)
    }

    pub fn unsubscribe_all(&self) {
        self.shared.messages.off_all();
    }

    pub fn presence(&self) -> Presence {
        Presence {
            channel: self.clone(),
        }
    }

    pub fn annotations(&self) -> Annotations {
        Annotations {
            channel: self.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Presence {
    channel: Channel,
}

impl Presence {
    async fn act(&self, action: PresenceAction, client_id: Option<String>, data: Data) -> Result<(), Error> {
        if let Some(e) = self.channel.failed_error() {
            return Err(e);
        }
        let shared = Arc::clone(&self.channel.shared);
        complete(&self.channel.inner.commands, |completion| Command::Presence {
            shared,
            action,
            client_id,
            data,
            completion,
        })
        .await
    }

    pub async fn enter(&self, data: impl Into<Data>) -> Result<(), Error> {
        self.act(PresenceAction::Enter, None, data.into()).await
    }

    pub async fn update(&self, data: impl Into<Data>) -> Result<(), Error> {
        self.act(PresenceAction::Update, None, data.into()).await
    }

    pub async fn leave(&self, data: impl Into<Data>) -> Result<(), Error> {
        self.act(PresenceAction::Leave, None, data.into()).await
    }

    /// Enters on behalf of another client; needs a wildcard client id.
    pub async fn enter_client(&self, client_id: &str, data: impl Into<Data>) -> Result<(), Error> {
        self.act(PresenceAction::Enter, Some(client_id.to_string()), data.into())
            .await
    }

    pub async fn update_client(&self, client_id: &str, data: impl Into<Data>) -> Result<(), Error> {
        self.act(PresenceAction::Update, Some(client_id.to_string()), data.into())
            .await
    }

    pub async fn leave_client(&self, client_id: &str, data: impl Into<Data>) -> Result<(), Error> {
        self.act(PresenceAction::Leave, Some(client_id.to_string()), data.into())
            .await
    }

    /// Current members, after attaching and (by default) waiting for sync.
    pub async fn get(&self, params: PresenceGetParams) -> Result<Vec<PresenceMessage>, Error> {
        if let Some(e) = self.channel.failed_error() {
            return Err(e);
        }
        let (reply, rx) = oneshot::channel();
        let command = Command::PresenceGet {
            shared: Arc::clone(&self.channel.shared),
            request: PendingGet { params, reply },
        };
        send(&self.channel.inner.commands, command)?;
        rx.await.map_err(|_| Error::Closed)?.map_err(Error::from)
    }

    /// Registers a listener filtered by presence action name and attaches.
    pub async fn subscribe<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Result<ListenerId, Error>
    where
        F: Fn(&PresenceMessage) + Send + Sync + 'static,
    {
        if let Some(e) = self.channel.failed_error() {
            return Err(e);
        }
        let id = self.channel.shared.presence.on(filter, listener);
        if let Err(e) = self.channel.attach().await {
            self.channel.shared.presence.off(id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.channel.shared.presence.off(id)
    }
}

// ---------------------------------------------------------------------------
// Annotations
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Annotations {
    channel: Channel,
}

impl Annotations {
    /// Publishes `annotation` against the message with `message_serial`.
    pub async fn publish(&self, message_serial: &str, mut annotation: Annotation) -> Result<(), Error> {
        annotation.message_serial = message_serial.to_string();
        let shared = Arc::clone(&self.channel.shared);
        complete(&self.channel.inner.commands, |completion| Command::Annotate {
            shared,
            annotation: Box::new(annotation),
            completion,
        })
        .await
    }

    /// Registers a listener filtered by annotation type. The channel must be
    /// attached with the `AnnotationSubscribe` mode.
    pub async fn subscribe<F>(&self, filter: impl Into<EventFilter>, listener: F) -> Result<ListenerId, Error>
    where
        F: Fn(&Annotation) + Send + Sync + 'static,
    {
        if let Some(e) = self.channel.failed_error() {
            return Err(e);
        }
        self.channel.attach().await?;
        if !self
            .channel
            .properties()
            .modes
            .contains(&ChannelMode::AnnotationSubscribe)
        {
            return Err(Error::Ably(ErrorInfo::new(
                error_code::ANNOTATION_MODE_MISSING,
                400,
                "You are trying to add an annotation listener, but the channel was not attached \
                 with the annotation_subscribe mode",
            )));
        }
        Ok(self.channel.shared.annotations.on(filter, listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.channel.shared.annotations.off(id)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

enum AuthEvent {
    Connect {
        connect_count: u64,
        result: Result<TokenDetails, ErrorInfo>,
    },
    Reauth(Result<TokenDetails, ErrorInfo>),
}

struct EventLoop {
    manager: ConnectionManager,
    registry: ChannelRegistry,
    auth: Auth,
    channels: SharedChannels,
    factories: HashMap<String, Arc<dyn TransportFactory>>,
    transports: HashMap<TransportId, TransportHandle>,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_tx: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
    transport_rx: mpsc::UnboundedReceiver<(TransportId, TransportEvent)>,
    auth_tx: mpsc::UnboundedSender<AuthEvent>,
    auth_rx: mpsc::UnboundedReceiver<AuthEvent>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            let deadline = [self.manager.next_deadline(), self.registry.next_deadline()]
                .into_iter()
                .flatten()
                .min();

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                Some((id, event)) = self.transport_rx.recv() => self.on_transport_event(id, event),
                Some(event) = self.auth_rx.recv() => self.on_auth_event(event),
                _ = sleep_until(deadline) => {
                    let now = Instant::now();
                    self.manager.on_timer(now);
                    self.registry.on_timer(&mut self.manager, now);
                }
            }
            self.flush();
        }
    }

    fn shutdown(&mut self) {
        debug!("all client handles dropped; shutting down");
        self.manager.close(Instant::now());
        self.flush();
        for (_, handle) in self.transports.drain() {
            let _ = handle.send(Outgoing::Close);
        }
    }

    /// Looks up the channel core behind a handle, recreating it after a release.
    fn channel<'a>(
        registry: &'a mut ChannelRegistry,
        channels: &SharedChannels,
        manager: &ConnectionManager,
        shared: &Arc<ChannelShared>,
    ) -> Option<&'a mut ChannelCore> {
        channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(shared.name.clone())
            .or_insert_with(|| Arc::clone(shared));
        registry.ensure(Arc::clone(shared), None, manager.format());
        registry.get_mut(&shared.name)
    }

    fn on_command(&mut self, cmd: Command) {
        let now = Instant::now();
        let (registry, channels, manager) = (&mut self.registry, &self.channels, &mut self.manager);
        match cmd {
            Command::Connect => manager.connect(now),
            Command::Close => manager.close(now),
            Command::Ping(reply) => manager.ping(reply, now),
            Command::RecoveryKey(reply) => {
                let _ = reply.send(manager.recovery_key(registry.channel_serials()));
            }
            Command::Ensure { shared, options } => {
                registry.ensure(shared, options.map(|o| *o), manager.format());
            }
            Command::Attach { shared, completion } => {
                if let Some(channel) = Self::channel(registry, channels, manager, &shared) {
                    channel.attach(Some(completion), manager, now);
                }
            }
            Command::Detach { shared, completion } => {
                if let Some(channel) = Self::channel(registry, channels, manager, &shared) {
                    channel.detach(completion, manager, now);
                }
            }
            Command::Publish {
                shared,
                messages,
                completion,
            } => {
                if let Some(channel) = Self::channel(registry, channels, manager, &shared) {
                    channel.publish(messages, completion, manager);
                }
            }
            Command::Annotate {
                shared,
                annotation,
                completion,
            } => {
                if let Some(channel) = Self::channel(registry, channels, manager, &shared) {
                    channel.publish_annotation(*annotation, completion, manager);
                }
            }
            Command::Presence {
                shared,
                action,
                client_id,
                data,
                completion,
            } => {
                if let Some(channel) = Self::channel(registry, channels, manager, &shared) {
                    channel.presence_action(action, client_id, data, completion, manager, now);
                }
            }
            Command::PresenceGet { shared, request } => {
                if let Some(channel) = Self::channel(registry, channels, manager, &shared) {
                    channel.presence_get(request, manager, now);
                }
            }
            Command::SetOptions {
                shared,
                options,
                completion,
            } => {
                if let Some(channel) = Self::channel(registry, channels, manager, &shared) {
                    channel.set_options(*options, completion, manager);
                }
            }
            Command::Release(name) => registry.release(&name, manager, now),
            Command::Diagnostic(cmd) => cmd.apply(manager, registry, now),
        }
    }

    fn on_transport_event(&mut self, id: TransportId, event: TransportEvent) {
        let now = Instant::now();
        match event {
            TransportEvent::Opened => self.manager.on_transport_opened(id, now),
            TransportEvent::Message(msg) => self.manager.on_protocol_message(id, *msg, now),
            TransportEvent::Closed(error) => {
                self.transports.remove(&id);
                self.manager.on_transport_closed(id, error, now);
            }
        }
    }

    fn on_auth_event(&mut self, event: AuthEvent) {
        let now = Instant::now();
        match event {
            AuthEvent::Connect {
                connect_count,
                result,
            } => {
                let result = result.map(|token| self.auth.store(token));
                self.manager.on_auth_result(connect_count, result, now);
            }
            AuthEvent::Reauth(result) => {
                let result = result.map(|token| self.auth.store(token));
                self.manager.on_reauth_result(result, now);
            }
        }
    }

    /// Delivers channel signals and carries out effects until both run dry.
    fn flush(&mut self) {
        loop {
            let now = Instant::now();
            let signals = self.manager.take_signals();
            let drained = signals.is_empty();
            for signal in signals {
                self.registry.on_signal(signal, &mut self.manager, now);
            }
            let effects = self.manager.take_effects();
            if drained && effects.is_empty() {
                return;
            }
            for effect in effects {
                self.apply(effect, now);
            }
        }
    }

    fn apply(&mut self, effect: Effect, now: Instant) {
        match effect {
            Effect::Open {
                id,
                transport: name,
                params,
            } => match self.factories.get(&name) {
                Some(factory) => {
                    debug!(id, transport = %name, host = %params.host, "spawning transport");
                    let handle = transport::spawn(Arc::clone(factory), id, params, self.transport_tx.clone());
                    self.transports.insert(id, handle);
                }
                None => {
                    warn!(transport = %name, "no factory for transport");
                    let error = ErrorInfo::new(
                        error_code::BAD_REQUEST,
                        400,
                        format!("Transport {name} is not available"),
                    );
                    self.manager.on_transport_closed(id, Some(error), now);
                }
            },
            Effect::Send { id, msg } => match self.transports.get(&id) {
                Some(handle) => {
                    if handle.send(Outgoing::Frame(msg)).is_err() {
                        warn!(id, "transport task gone; frame dropped");
                    }
                }
                None => warn!(id, action = msg.action, "no transport for frame"),
            },
            Effect::Close { id } => {
                if let Some(handle) = self.transports.remove(&id) {
                    let _ = handle.send(Outgoing::Close);
                }
            }
            Effect::Authorize {
                connect_count,
                force_new,
                host,
            } => match self.auth.cached(force_new) {
                Some(result) => self.manager.on_auth_result(connect_count, result, now),
                None => {
                    let fetch = self.auth.fetch(host);
                    let tx = self.auth_tx.clone();
                    tokio::spawn(async move {
                        let result = fetch.await;
                        let _ = tx.send(AuthEvent::Connect {
                            connect_count,
                            result,
                        });
                    });
                }
            },
            Effect::Reauthorize => match self.auth.cached(true) {
                Some(result) => self.manager.on_reauth_result(result, now),
                None => {
                    info!("service requested reauthorization");
                    let fetch = self.auth.fetch(None);
                    let tx = self.auth_tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(AuthEvent::Reauth(fetch.await));
                    });
                }
            },
        }
    }
}
