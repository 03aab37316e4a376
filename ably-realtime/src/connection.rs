//! Connection management: transports, hosts, retries, acks and recovery.
//!
//! [`ConnectionManager`] is a synchronous state machine. It never performs
//! I/O itself; it records [`Effect`]s for the event loop to carry out and
//! [`ChannelSignal`]s for the channel registry, and is driven by the loop
//! calling the `on_*` methods with the current time.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::Credential;
use crate::backoff::retry_time;
use crate::channel::{ChannelSignal, ConnectionContext};
use crate::emitter::EventEmitter;
use crate::error::{ErrorInfo, error_code};
use crate::options::{ClientOptions, Timeouts};
use crate::protocol::{self, Format, Inbound, ProtocolMessage};
use crate::transport::{ConnectMode, TransportId, TransportParams};
use crate::types::{ConnectionState, ConnectionStateChange};

/// Minimum spacing between immediate reconnects after a dropped connection.
const IMMEDIATE_RETRY_WINDOW: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Completions
// ---------------------------------------------------------------------------

/// Callback run once when an operation succeeds or fails.
pub(crate) struct Completion(Box<dyn FnOnce(Result<(), ErrorInfo>) + Send>);

impl Completion {
    pub(crate) fn new(f: impl FnOnce(Result<(), ErrorInfo>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Delivers the result to a waiting caller.
    pub(crate) fn reply(tx: oneshot::Sender<Result<(), ErrorInfo>>) -> Self {
        Self::new(move |result| {
            let _ = tx.send(result);
        })
    }

    pub(crate) fn complete(self, result: Result<(), ErrorInfo>) {
        (self.0)(result);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

pub(crate) type PingReply = oneshot::Sender<Result<Duration, ErrorInfo>>;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Connection properties readable from any handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub error_reason: Option<ErrorInfo>,
    pub id: Option<String>,
    pub key: Option<String>,
    pub client_id: Option<String>,
}

pub(crate) struct ConnectionShared {
    pub(crate) events: EventEmitter<ConnectionStateChange>,
    snapshot: Mutex<ConnectionSnapshot>,
}

impl ConnectionShared {
    pub(crate) fn new() -> Self {
        Self {
            events: EventEmitter::new(),
            snapshot: Mutex::new(ConnectionSnapshot::default()),
        }
    }

    pub(crate) fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, snapshot: ConnectionSnapshot) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

// ---------------------------------------------------------------------------
// Recovery key
// ---------------------------------------------------------------------------

/// Serialised connection state that lets a new client take over a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RecoveryKey {
    pub(crate) connection_key: String,
    pub(crate) msg_serial: i64,
    #[serde(default)]
    pub(crate) channel_serials: HashMap<String, String>,
}

impl RecoveryKey {
    pub(crate) fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    pub(crate) fn decode(key: &str) -> Option<Self> {
        match serde_json::from_str(key) {
            Ok(k) => Some(k),
            Err(e) => {
                warn!(error = %e, "ignoring undecodable recovery key");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Work for the event loop.
#[derive(Debug)]
pub(crate) enum Effect {
    Open {
        id: TransportId,
        transport: String,
        params: TransportParams,
    },
    Send {
        id: TransportId,
        msg: Box<ProtocolMessage>,
    },
    Close {
        id: TransportId,
    },
    /// Resolve credentials for connect attempt `connect_count`.
    Authorize {
        connect_count: u64,
        force_new: bool,
        /// Fallback host that last reached CONNECTED, for token requests.
        host: Option<String>,
    },
    /// The service asked for a fresh token on the live connection.
    Reauthorize,
}

/// Static connection settings derived from [`ClientOptions`].
#[derive(Debug, Clone)]
pub(crate) struct ManagerConfig {
    pub(crate) primary_host: String,
    pub(crate) fallback_hosts: Vec<String>,
    pub(crate) port: Option<u16>,
    pub(crate) tls: bool,
    pub(crate) format: Format,
    pub(crate) transports: Vec<String>,
    pub(crate) client_id: Option<String>,
    pub(crate) echo: bool,
    pub(crate) queue_messages: bool,
    pub(crate) max_fallback_retries: usize,
    /// Token errors can be healed by fetching a new token.
    pub(crate) renewable: bool,
    pub(crate) timeouts: Timeouts,
}

impl ManagerConfig {
    pub(crate) fn from_options(options: &ClientOptions) -> Self {
        Self {
            primary_host: options.realtime_host().to_string(),
            fallback_hosts: options.fallback_hosts(),
            port: options.port,
            tls: options.tls,
            format: options.format(),
            transports: options.transports.clone(),
            client_id: options.client_id.clone(),
            echo: options.echo_messages,
            queue_messages: options.queue_messages,
            max_fallback_retries: options.max_fallback_retries,
            renewable: options.auth_callback.is_some(),
            timeouts: options.timeouts.clone(),
        }
    }
}

/// Transport names and hosts, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportState {
    pub active: Option<(String, String)>,
    pub pending: Vec<(String, String)>,
    pub preference: Option<String>,
}

/// Identity and serials of the current connection, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInternals {
    pub id: Option<String>,
    pub key: Option<String>,
    pub msg_serial: i64,
    pub connection_serial: i64,
}

struct Slot {
    id: TransportId,
    name: String,
    host: String,
    upgrade: bool,
    preferred: bool,
}

struct Outbound {
    msg: ProtocolMessage,
    completions: Vec<Completion>,
}

impl Outbound {
    fn finish(self, result: &Result<(), ErrorInfo>) {
        for c in self.completions {
            c.complete(result.clone());
        }
    }
}

struct PingWaiter {
    id: String,
    started: Instant,
    deadline: Instant,
    reply: PingReply,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub(crate) struct ConnectionManager {
    config: ManagerConfig,
    shared: Arc<ConnectionShared>,

    state: ConnectionState,
    error_reason: Option<ErrorInfo>,
    connection_id: Option<String>,
    connection_key: Option<String>,
    client_id: Option<String>,
    msg_serial: i64,
    connection_serial: i64,
    connection_state_ttl: Duration,
    max_idle_interval: Duration,
    last_activity: Option<Instant>,

    next_transport_id: TransportId,
    active: Option<Slot>,
    pending: Vec<Slot>,
    credential: Option<Credential>,
    preference: Option<String>,
    /// Upgrade transport that reached CONNECTED while acks were outstanding.
    upgrade_waiting: Option<(TransportId, protocol::Connected)>,

    host_index: usize,
    fallback_attempts: usize,
    sticky_host: Option<(String, Instant)>,

    queued: VecDeque<Outbound>,
    inflight: VecDeque<Outbound>,
    pings: Vec<PingWaiter>,

    transition_deadline: Option<Instant>,
    suspend_deadline: Option<Instant>,
    suspend_elapsed: bool,
    retry_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    disconnected_retries: u32,
    suspended_retries: u32,
    last_immediate_retry: Option<Instant>,

    connect_count: u64,
    force_new_token: bool,
    token_retry_used: bool,
    recover: Option<RecoveryKey>,
    recover_mode: bool,

    effects: Vec<Effect>,
    signals: Vec<ChannelSignal>,
}

impl ConnectionManager {
    pub(crate) fn new(config: ManagerConfig, shared: Arc<ConnectionShared>, recover: Option<&str>) -> Self {
        let recover = recover.and_then(RecoveryKey::decode);
        let timeouts = config.timeouts.clone();
        let manager = Self {
            client_id: config.client_id.clone(),
            config,
            shared,
            state: ConnectionState::Initialized,
            error_reason: None,
            connection_id: None,
            connection_key: None,
            msg_serial: recover.as_ref().map_or(0, |k| k.msg_serial),
            connection_serial: -1,
            connection_state_ttl: timeouts.connection_state_ttl,
            max_idle_interval: timeouts.max_idle_interval,
            last_activity: None,
            next_transport_id: 0,
            active: None,
            pending: Vec::new(),
            credential: None,
            preference: None,
            upgrade_waiting: None,
            host_index: 0,
            fallback_attempts: 0,
            sticky_host: None,
            queued: VecDeque::new(),
            inflight: VecDeque::new(),
            pings: Vec::new(),
            transition_deadline: None,
            suspend_deadline: None,
            suspend_elapsed: false,
            retry_deadline: None,
            close_deadline: None,
            disconnected_retries: 0,
            suspended_retries: 0,
            last_immediate_retry: None,
            connect_count: 0,
            force_new_token: false,
            token_retry_used: false,
            recover,
            recover_mode: false,
            effects: Vec::new(),
            signals: Vec::new(),
        };
        manager.publish_snapshot();
        manager
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn take_signals(&mut self) -> Vec<ChannelSignal> {
        std::mem::take(&mut self.signals)
    }

    fn timeouts(&self) -> &Timeouts {
        &self.config.timeouts
    }

    fn publish_snapshot(&self) {
        self.shared.store(ConnectionSnapshot {
            state: self.state,
            error_reason: self.error_reason.clone(),
            id: self.connection_id.clone(),
            key: self.connection_key.clone(),
            client_id: self.client_id.clone(),
        });
    }

    // ---- public operations ----

    pub(crate) fn connect(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            ConnectionState::Closing => {
                debug!("connect requested while closing; waiting for close to finish");
            }
            _ => self.start_connecting(now),
        }
    }

    pub(crate) fn close(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {}
            ConnectionState::Connected => {
                if let Some(id) = self.active.as_ref().map(|a| a.id) {
                    self.effects.push(Effect::Send {
                        id,
                        msg: Box::new(protocol::build_close_msg()),
                    });
                }
                self.notify_state(ConnectionState::Closing, None, false, now);
                self.close_deadline = Some(now + self.timeouts().realtime_request_timeout);
            }
            _ => {
                self.disconnect_all_transports();
                self.notify_state(ConnectionState::Closed, None, false, now);
            }
        }
    }

    pub(crate) fn ping(&mut self, reply: PingReply, now: Instant) {
        let transport = self
            .active
            .as_ref()
            .map(|a| a.id)
            .filter(|_| self.state == ConnectionState::Connected);
        let Some(transport) = transport else {
            let _ = reply.send(Err(ErrorInfo::new(
                error_code::BAD_REQUEST,
                400,
                "Unable to ping service; not connected",
            )));
            return;
        };
        let id = format!("{:016x}", rand::random::<u64>());
        self.effects.push(Effect::Send {
            id: transport,
            msg: Box::new(protocol::build_heartbeat_msg(Some(id.clone()))),
        });
        self.pings.push(PingWaiter {
            id,
            started: now,
            deadline: now + self.timeouts().realtime_request_timeout,
            reply,
        });
    }

    /// Recovery key for the current connection, if it can still be recovered.
    pub(crate) fn recovery_key(&self, channel_serials: HashMap<String, String>) -> Option<String> {
        if matches!(
            self.state,
            ConnectionState::Closing
                | ConnectionState::Closed
                | ConnectionState::Failed
                | ConnectionState::Suspended
        ) {
            return None;
        }
        RecoveryKey {
            connection_key: self.connection_key.clone()?,
            msg_serial: self.msg_serial,
            channel_serials,
        }
        .encode()
    }

    // ---- state transitions ----

    fn start_connecting(&mut self, now: Instant) {
        if self.suspend_deadline.is_none() && !self.suspend_elapsed {
            self.suspend_deadline = Some(now + self.connection_state_ttl);
        }
        self.notify_state(ConnectionState::Connecting, None, false, now);
        self.begin_attempt(now);
    }

    /// Requests credentials for a fresh attempt; transports open once they arrive.
    fn begin_attempt(&mut self, now: Instant) {
        let stale_after = self.connection_state_ttl + self.max_idle_interval;
        if self.connection_key.is_some()
            && self.last_activity.is_some_and(|t| now.duration_since(t) > stale_after)
        {
            info!("connection state expired; connecting afresh");
            self.clear_connection();
        }
        self.connect_count += 1;
        let mut timeout = self.timeouts().realtime_request_timeout;
        if self.preference.is_some() {
            timeout += self.timeouts().preference_connect_timeout;
        }
        self.transition_deadline = Some(now + timeout);
        let host = self
            .sticky_host
            .as_ref()
            .filter(|(_, until)| *until > now)
            .map(|(h, _)| h.clone());
        self.effects.push(Effect::Authorize {
            connect_count: self.connect_count,
            force_new: std::mem::take(&mut self.force_new_token),
            host,
        });
    }

    fn fail_state(&self) -> ConnectionState {
        if self.suspend_elapsed {
            ConnectionState::Suspended
        } else {
            ConnectionState::Disconnected
        }
    }

    fn notify_state(
        &mut self,
        state: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_immediately: bool,
        now: Instant,
    ) {
        if state == self.state {
            return;
        }
        self.transition_deadline = None;
        self.retry_deadline = None;
        if state != ConnectionState::Closing {
            self.close_deadline = None;
        }
        if !matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Disconnected | ConnectionState::Suspended
        ) {
            self.suspend_deadline = None;
            self.suspend_elapsed = false;
        }

        let reason = reason.or_else(|| ErrorInfo::for_connection_state(state));
        let mut retry_in = None;
        match state {
            ConnectionState::Disconnected => {
                let immediate = retry_immediately
                    && self
                        .last_immediate_retry
                        .is_none_or(|t| now.duration_since(t) >= IMMEDIATE_RETRY_WINDOW);
                let delay = if immediate {
                    self.last_immediate_retry = Some(now);
                    Duration::ZERO
                } else {
                    self.disconnected_retries = self.disconnected_retries.saturating_add(1);
                    retry_time(self.timeouts().disconnected_retry_timeout, self.disconnected_retries)
                };
                self.retry_deadline = Some(now + delay);
                retry_in = Some(delay);
            }
            ConnectionState::Suspended => {
                self.disconnected_retries = 0;
                self.suspended_retries = self.suspended_retries.saturating_add(1);
                let delay = retry_time(self.timeouts().suspended_retry_timeout, self.suspended_retries);
                self.retry_deadline = Some(now + delay);
                retry_in = Some(delay);
            }
            ConnectionState::Connected => {
                self.disconnected_retries = 0;
                self.suspended_retries = 0;
                self.error_reason = None;
            }
            _ => {}
        }

        if let Some(r) = &reason {
            self.error_reason = Some(r.clone());
        }
        if matches!(
            state,
            ConnectionState::Suspended | ConnectionState::Closed | ConnectionState::Failed
        ) {
            let err = reason.clone().unwrap_or_else(ErrorInfo::unknown_connection);
            self.fail_outbound(&err);
            self.clear_connection();
        }

        let previous = self.state;
        self.state = state;
        if state == ConnectionState::Failed {
            error!(from = %previous, reason = ?reason, "connection failed");
        } else {
            info!(from = %previous, to = %state, reason = ?reason, ?retry_in, "connection state change");
        }
        self.publish_snapshot();

        if let Some(r) = &reason
            && matches!(
                state,
                ConnectionState::Closing
                    | ConnectionState::Closed
                    | ConnectionState::Failed
                    | ConnectionState::Suspended
            )
        {
            self.signals.push(ChannelSignal::Interrupted {
                state,
                reason: r.clone(),
            });
        }
        let change = ConnectionStateChange {
            previous,
            current: state,
            reason,
            retry_in,
        };
        self.shared.events.emit(state.as_str(), &change);
    }

    fn clear_connection(&mut self) {
        self.connection_id = None;
        self.connection_key = None;
        self.msg_serial = 0;
        self.connection_serial = -1;
    }

    fn fail_outbound(&mut self, err: &ErrorInfo) {
        let result = Err(err.clone());
        for item in self.inflight.drain(..).chain(self.queued.drain(..)) {
            item.finish(&result);
        }
        for ping in self.pings.drain(..) {
            let _ = ping.reply.send(Err(err.clone()));
        }
    }

    fn fail(&mut self, reason: ErrorInfo, now: Instant) {
        self.disconnect_all_transports();
        self.notify_state(ConnectionState::Failed, Some(reason), false, now);
    }

    // ---- transports ----

    fn current_host(&self, now: Instant) -> String {
        if let Some(fallback) = self
            .host_index
            .checked_sub(1)
            .and_then(|i| self.config.fallback_hosts.get(i))
        {
            return fallback.clone();
        }
        match &self.sticky_host {
            Some((host, until)) if *until > now => host.clone(),
            _ => self.config.primary_host.clone(),
        }
    }

    fn base_transport(&self) -> Option<&String> {
        self.config.transports.first()
    }

    fn open(&mut self, name: String, mode: ConnectMode, flags: (bool, bool), now: Instant) {
        let Some(credential) = self.credential.clone() else {
            return;
        };
        let (upgrade, preferred) = flags;
        self.next_transport_id += 1;
        let id = self.next_transport_id;
        let host = self.current_host(now);
        let connect_timeout = if preferred {
            self.timeouts().preference_connect_timeout
        } else {
            self.timeouts().web_socket_connect_timeout
        };
        debug!(transport = %name, %host, id, ?mode, "opening transport");
        let params = TransportParams {
            host: host.clone(),
            port: self.config.port,
            tls: self.config.tls,
            format: self.config.format,
            mode,
            credential,
            client_id: self.config.client_id.clone(),
            echo: self.config.echo,
            connect_timeout,
        };
        self.pending.push(Slot {
            id,
            name: name.clone(),
            host,
            upgrade,
            preferred,
        });
        self.effects.push(Effect::Open {
            id,
            transport: name,
            params,
        });
    }

    fn connect_mode(&mut self) -> ConnectMode {
        if let Some(recover) = &self.recover {
            self.recover_mode = true;
            return ConnectMode::Recover(recover.connection_key.clone());
        }
        match &self.connection_key {
            Some(key) => ConnectMode::Resume(key.clone()),
            None => ConnectMode::Clean,
        }
    }

    pub(crate) fn on_auth_result(
        &mut self,
        connect_count: u64,
        result: Result<Credential, ErrorInfo>,
        now: Instant,
    ) {
        if connect_count != self.connect_count || self.state != ConnectionState::Connecting {
            debug!(connect_count, "discarding stale auth result");
            return;
        }
        match result {
            Err(e) => self.act_on_auth_error(e, now),
            Ok(credential) => {
                self.credential = Some(credential);
                let mode = self.connect_mode();
                let preferred = self
                    .preference
                    .clone()
                    .filter(|p| self.config.transports.contains(p));
                match (preferred, self.base_transport().cloned()) {
                    (Some(p), _) => self.open(p, mode, (false, true), now),
                    (None, Some(base)) => self.open(base, mode, (false, false), now),
                    (None, None) => self.fail(
                        ErrorInfo::new(error_code::BAD_REQUEST, 400, "No transports configured"),
                        now,
                    ),
                }
            }
        }
    }

    pub(crate) fn on_reauth_result(&mut self, result: Result<Credential, ErrorInfo>, now: Instant) {
        match result {
            Ok(Credential::Token(token)) => {
                self.credential = Some(Credential::Token(token.clone()));
                if let (ConnectionState::Connected, Some(id)) = (self.state, self.active.as_ref().map(|a| a.id)) {
                    self.effects.push(Effect::Send {
                        id,
                        msg: Box::new(protocol::build_auth_msg(token)),
                    });
                }
            }
            Ok(Credential::Key(_)) => debug!("basic auth needs no reauthorization"),
            Err(e) if Self::auth_error_is_fatal(&e) => self.act_on_auth_error(e, now),
            Err(e) => warn!(error = %e, "reauthorization failed"),
        }
    }

    fn auth_error_is_fatal(e: &ErrorInfo) -> bool {
        matches!(
            e.code,
            error_code::TOKEN_NOT_RENEWABLE | error_code::INCOMPATIBLE_CREDENTIALS
        ) || e.status_code == Some(403)
    }

    fn act_on_auth_error(&mut self, e: ErrorInfo, now: Instant) {
        warn!(error = %e, "authorization failed");
        if matches!(
            e.code,
            error_code::TOKEN_NOT_RENEWABLE | error_code::INCOMPATIBLE_CREDENTIALS
        ) {
            self.fail(e, now);
        } else if e.status_code == Some(403) {
            let reason = ErrorInfo::new(
                error_code::AUTH_CALLBACK_FAILED,
                403,
                format!("Client configured authentication provider returned 403: {}", e.message),
            );
            self.fail(reason, now);
        } else {
            let reason = if e.code == error_code::AUTH_CALLBACK_FAILED {
                e
            } else {
                ErrorInfo::new(
                    error_code::AUTH_CALLBACK_FAILED,
                    401,
                    format!("Client configured authentication provider request failed: {}", e.message),
                )
            };
            self.disconnect_all_transports();
            let state = self.fail_state();
            self.notify_state(state, Some(reason), false, now);
        }
    }

    pub(crate) fn on_transport_opened(&mut self, id: TransportId, now: Instant) {
        if let Some(slot) = self.pending.iter().find(|s| s.id == id) {
            debug!(transport = %slot.name, host = %slot.host, id, "transport open; awaiting CONNECTED");
            self.last_activity = Some(now);
        }
    }

    fn is_active(&self, id: TransportId) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == id)
    }

    /// Closes every transport and requeues unacknowledged messages. Close
    /// events for these transports are ignored afterwards.
    fn disconnect_all_transports(&mut self) {
        if let Some(active) = self.active.take() {
            self.effects.push(Effect::Close { id: active.id });
            self.requeue_inflight();
        }
        for slot in self.pending.drain(..) {
            self.effects.push(Effect::Close { id: slot.id });
        }
        self.upgrade_waiting = None;
    }

    fn requeue_inflight(&mut self) {
        while let Some(item) = self.inflight.pop_back() {
            self.queued.push_front(item);
        }
    }

    pub(crate) fn on_transport_closed(&mut self, id: TransportId, error: Option<ErrorInfo>, now: Instant) {
        if self.is_active(id) {
            self.active = None;
            self.requeue_inflight();
            for slot in self.pending.drain(..) {
                self.effects.push(Effect::Close { id: slot.id });
            }
            self.upgrade_waiting = None;
            if self.state == ConnectionState::Closing {
                self.notify_state(ConnectionState::Closed, None, false, now);
            } else {
                warn!(id, error = ?error, "active transport closed");
                self.on_transport_failure(error, now);
            }
            return;
        }
        let Some(pos) = self.pending.iter().position(|s| s.id == id) else {
            return;
        };
        let slot = self.pending.remove(pos);
        if slot.upgrade {
            debug!(transport = %slot.name, error = ?error, "upgrade transport closed");
            return;
        }
        if self.state != ConnectionState::Connecting {
            return;
        }
        if slot.preferred {
            info!(transport = %slot.name, "preferred transport failed; falling back to base transport");
            self.preference = None;
            if let Some(base) = self.base_transport().cloned() {
                let mode = self.connect_mode();
                self.open(base, mode, (false, false), now);
            }
            return;
        }
        self.on_transport_failure(error, now);
    }

    /// Decides what to do after losing the connection or failing to get one.
    /// All transports must already be closed.
    fn on_transport_failure(&mut self, error: Option<ErrorInfo>, now: Instant) {
        let was_connected = self.state == ConnectionState::Connected;
        if let Some(e) = error.clone() {
            if e.is_token_error() && self.config.renewable {
                self.force_new_token = true;
                let immediate = !self.token_retry_used;
                self.token_retry_used = true;
                let state = self.fail_state();
                self.notify_state(state, Some(e), immediate, now);
                return;
            }
            if e.is_token_error() || !e.is_retriable() {
                self.fail(e, now);
                return;
            }
        }

        let server_error = error.as_ref().is_some_and(ErrorInfo::is_server_error);
        if (!was_connected || server_error) && self.advance_fallback() {
            let host = self.current_host(now);
            info!(%host, "trying fallback host");
            if self.state == ConnectionState::Connecting {
                self.begin_attempt(now);
            } else {
                self.notify_state(ConnectionState::Disconnected, error, true, now);
            }
            return;
        }

        let mut reason = error.unwrap_or_else(ErrorInfo::disconnected);
        if !was_connected && self.host_index > 0 {
            reason = ErrorInfo::new(
                error_code::DISCONNECTED,
                404,
                "Unable to connect (and no more fallback hosts to try)",
            );
        }
        self.host_index = 0;
        self.fallback_attempts = 0;
        let state = self.fail_state();
        self.notify_state(state, Some(reason), was_connected, now);
    }

    fn advance_fallback(&mut self) -> bool {
        if self.fallback_attempts >= self.config.max_fallback_retries
            || self.host_index >= self.config.fallback_hosts.len()
        {
            return false;
        }
        self.host_index += 1;
        self.fallback_attempts += 1;
        true
    }

    // ---- inbound ----

    pub(crate) fn on_protocol_message(&mut self, id: TransportId, msg: ProtocolMessage, now: Instant) {
        let active = self.is_active(id);
        if !active && !self.pending.iter().any(|s| s.id == id) {
            debug!(id, action = msg.action, "frame from inactive transport dropped");
            return;
        }
        self.last_activity = Some(now);
        if active && let Some(serial) = msg.connection_serial {
            self.connection_serial = serial;
        }
        let inbound = match Inbound::try_from(msg) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "malformed protocol message");
                return;
            }
        };

        match inbound {
            Inbound::Connected(connected) => self.on_connected(id, connected, now),
            _ if !active => {
                self.on_pending_frame(id, inbound, now);
            }
            Inbound::Heartbeat { id: ping_id } => self.on_heartbeat(ping_id, now),
            Inbound::Ack { msg_serial, count } => {
                self.on_ack(msg_serial, count, None);
                self.try_pending_upgrade(now);
            }
            Inbound::Nack {
                msg_serial,
                count,
                error,
            } => {
                let err = error.unwrap_or_else(ErrorInfo::unknown_channel);
                warn!(msg_serial, count, error = %err, "NACK received");
                self.on_ack(msg_serial, count, Some(err));
                self.try_pending_upgrade(now);
            }
            Inbound::Disconnected { error } => {
                warn!(error = ?error, "DISCONNECTED received");
                self.disconnect_all_transports();
                self.on_transport_failure(error, now);
            }
            Inbound::Closed => {
                self.disconnect_all_transports();
                if self.state == ConnectionState::Closing {
                    self.notify_state(ConnectionState::Closed, None, false, now);
                } else {
                    self.on_transport_failure(None, now);
                }
            }
            Inbound::Error { channel: None, error } => {
                let err = error.unwrap_or_else(ErrorInfo::unknown_connection);
                error!(error = %err, "connection ERROR received");
                self.disconnect_all_transports();
                if err.is_token_error() {
                    self.on_transport_failure(Some(err), now);
                } else {
                    self.fail(err, now);
                }
            }
            Inbound::Auth => self.effects.push(Effect::Reauthorize),
            Inbound::Other(action) => debug!(action, "ignoring unexpected action"),
            frame => self.signals.push(ChannelSignal::Frame(frame)),
        }
    }

    /// Frames other than CONNECTED from a transport still being set up.
    fn on_pending_frame(&mut self, id: TransportId, inbound: Inbound, now: Instant) {
        let upgrade = self.pending.iter().any(|s| s.id == id && s.upgrade);
        match inbound {
            Inbound::Disconnected { error } | Inbound::Error { channel: None, error } if !upgrade => {
                warn!(error = ?error, "connect attempt rejected");
                self.disconnect_all_transports();
                self.on_transport_failure(error, now);
            }
            Inbound::Disconnected { .. } | Inbound::Error { channel: None, .. } => {
                self.pending.retain(|s| s.id != id);
                self.effects.push(Effect::Close { id });
            }
            other => debug!(id, action = other.name(), "ignoring frame on pending transport"),
        }
    }

    fn on_heartbeat(&mut self, ping_id: Option<String>, now: Instant) {
        let Some(ping_id) = ping_id else {
            return;
        };
        if let Some(pos) = self.pings.iter().position(|p| p.id == ping_id) {
            let ping = self.pings.swap_remove(pos);
            let _ = ping.reply.send(Ok(now.duration_since(ping.started)));
        }
    }

    fn on_ack(&mut self, serial: i64, count: i64, error: Option<ErrorInfo>) {
        let end = serial.saturating_add(count);
        let result = error.map_or(Ok(()), Err);
        while let Some(front) = self.inflight.front() {
            if front.msg.msg_serial.unwrap_or_default() >= end {
                break;
            }
            if let Some(item) = self.inflight.pop_front() {
                item.finish(&result);
            }
        }
    }

    fn on_connected(&mut self, id: TransportId, connected: protocol::Connected, now: Instant) {
        if self.is_active(id) {
            let reset = self.set_connection(&connected);
            self.emit_update(connected.error.clone());
            if reset {
                self.signals.push(ChannelSignal::TransportActive {
                    reason: connected.error,
                });
            }
            return;
        }
        let Some(slot) = self.pending.iter().find(|s| s.id == id) else {
            return;
        };
        if slot.upgrade {
            if self.inflight.is_empty() {
                self.activate_upgrade(id, connected, now);
            } else {
                debug!(id, pending_acks = self.inflight.len(), "upgrade waiting for acks");
                self.upgrade_waiting = Some((id, connected));
            }
            return;
        }
        if self.state != ConnectionState::Connecting {
            self.pending.retain(|s| s.id != id);
            self.effects.push(Effect::Close { id });
            return;
        }
        self.activate(id, connected, now);
    }

    fn try_pending_upgrade(&mut self, now: Instant) {
        if self.inflight.is_empty()
            && let Some((id, connected)) = self.upgrade_waiting.take()
        {
            self.activate_upgrade(id, connected, now);
        }
    }

    fn activate_upgrade(&mut self, id: TransportId, connected: protocol::Connected, now: Instant) {
        self.effects.push(Effect::Send {
            id,
            msg: Box::new(protocol::build_activate_msg()),
        });
        self.activate(id, connected, now);
    }

    /// Makes transport `id` the active one.
    fn activate(&mut self, id: TransportId, connected: protocol::Connected, now: Instant) {
        let Some(pos) = self.pending.iter().position(|s| s.id == id) else {
            return;
        };
        let slot = self.pending.remove(pos);
        if let Some(old) = self.active.take() {
            info!(from = %old.name, to = %slot.name, "transport upgraded");
            self.effects.push(Effect::Close { id: old.id });
            self.requeue_inflight();
        }
        if slot.upgrade {
            self.preference = Some(slot.name.clone());
        }
        if self.host_index > 0 {
            self.sticky_host = Some((slot.host.clone(), now + self.timeouts().fallback_retry_timeout));
        }
        self.host_index = 0;
        self.fallback_attempts = 0;
        self.token_retry_used = false;
        let was_upgrade = slot.upgrade;
        info!(transport = %slot.name, host = %slot.host, "transport active");
        self.active = Some(slot);

        let reason = connected.error.clone();
        self.set_connection(&connected);
        if self.recover_mode {
            self.recover_mode = false;
            if let Some(recover) = self.recover.take()
                && reason.is_none()
            {
                self.signals.push(ChannelSignal::Recover(recover.channel_serials));
            }
        }

        if self.state == ConnectionState::Connected {
            self.emit_update(reason.clone());
        } else {
            self.notify_state(ConnectionState::Connected, reason.clone(), false, now);
        }
        self.signals.push(ChannelSignal::TransportActive { reason });

        let stale: Vec<TransportId> = self
            .pending
            .iter()
            .filter(|s| !s.upgrade)
            .map(|s| s.id)
            .collect();
        for id in stale {
            self.pending.retain(|s| s.id != id);
            self.effects.push(Effect::Close { id });
        }

        if !was_upgrade && let Some(key) = self.connection_key.clone() {
            let active_name = self.active.as_ref().map(|a| a.name.clone());
            let upgrades: Vec<String> = self
                .config
                .transports
                .iter()
                .skip(1)
                .filter(|t| Some(*t) != active_name.as_ref())
                .cloned()
                .collect();
            for name in upgrades {
                self.open(name, ConnectMode::Upgrade(key.clone()), (true, false), now);
            }
        }
        self.send_queued();
    }

    /// Applies CONNECTED details. Returns true when message continuity was lost.
    fn set_connection(&mut self, connected: &protocol::Connected) -> bool {
        let changed = self
            .connection_id
            .as_deref()
            .is_some_and(|id| id != connected.connection_id);
        let reset = changed || connected.error.is_some();
        if reset {
            info!(connection_id = %connected.connection_id, reason = ?connected.error, "connection continuity lost");
            self.msg_serial = 0;
            self.connection_serial = -1;
            for item in self.queued.iter_mut() {
                item.msg.msg_serial = None;
            }
        }
        self.connection_id = Some(connected.connection_id.clone());
        self.connection_key = connected.connection_key.clone();
        if let Some(client_id) = &connected.details.client_id {
            self.client_id = Some(client_id.clone());
        }
        if let Some(ttl) = connected.details.connection_state_ttl.and_then(|ms| u64::try_from(ms).ok()) {
            self.connection_state_ttl = Duration::from_millis(ttl);
        }
        if let Some(idle) = connected.details.max_idle_interval.and_then(|ms| u64::try_from(ms).ok()) {
            self.max_idle_interval = Duration::from_millis(idle);
        }
        self.publish_snapshot();
        reset
    }

    fn emit_update(&mut self, reason: Option<ErrorInfo>) {
        if let Some(r) = &reason {
            self.error_reason = Some(r.clone());
            self.publish_snapshot();
        }
        let change = ConnectionStateChange {
            previous: ConnectionState::Connected,
            current: ConnectionState::Connected,
            reason,
            retry_in: None,
        };
        self.shared.events.emit("update", &change);
    }

    // ---- outbound ----

    fn send_queued(&mut self) {
        while let Some(item) = self.queued.pop_front() {
            self.send_now(item.msg, item.completions);
        }
    }

    fn send_now(&mut self, mut msg: ProtocolMessage, completions: Vec<Completion>) {
        let Some(id) = self.active.as_ref().map(|a| a.id) else {
            let err = ErrorInfo::unknown_connection();
            for c in completions {
                c.complete(Err(err.clone()));
            }
            return;
        };
        if protocol::ack_required(msg.action) {
            if msg.msg_serial.is_none() {
                msg.msg_serial = Some(self.msg_serial);
                self.msg_serial += 1;
            }
            self.inflight.push_back(Outbound {
                msg: msg.clone(),
                completions,
            });
        } else {
            for c in completions {
                c.complete(Ok(()));
            }
        }
        self.effects.push(Effect::Send {
            id,
            msg: Box::new(msg),
        });
    }

    // ---- timers ----

    fn idle_deadline(&self) -> Option<Instant> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        let window = self.max_idle_interval + self.timeouts().realtime_request_timeout;
        self.last_activity.map(|t| t + window)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        [
            self.transition_deadline,
            self.suspend_deadline,
            self.retry_deadline,
            self.close_deadline,
            self.idle_deadline(),
            self.pings.iter().map(|p| p.deadline).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub(crate) fn on_timer(&mut self, now: Instant) {
        let due = |d: Option<Instant>| d.is_some_and(|d| d <= now);

        if due(self.transition_deadline) {
            self.transition_deadline = None;
            if self.state == ConnectionState::Connecting {
                warn!("connect attempt timed out");
                self.disconnect_all_transports();
                self.on_transport_failure(
                    Some(ErrorInfo {
                        code: error_code::DISCONNECTED,
                        status_code: None,
                        message: "Timed out waiting for the connection to open".to_string(),
                        href: None,
                    }),
                    now,
                );
            }
        }
        if due(self.suspend_deadline) {
            self.suspend_deadline = None;
            self.suspend_elapsed = true;
            if self.state == ConnectionState::Disconnected {
                self.notify_state(ConnectionState::Suspended, None, false, now);
            }
        }
        if due(self.retry_deadline) {
            self.retry_deadline = None;
            if matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Suspended
            ) {
                self.start_connecting(now);
            }
        }
        if due(self.close_deadline) {
            self.close_deadline = None;
            if self.state == ConnectionState::Closing {
                self.disconnect_all_transports();
                self.notify_state(ConnectionState::Closed, None, false, now);
            }
        }
        if due(self.idle_deadline()) {
            let idle_ms = self.max_idle_interval.as_millis();
            warn!(idle_ms, "no activity from realtime; assuming connection dropped");
            self.disconnect_all_transports();
            self.on_transport_failure(
                Some(ErrorInfo::new(
                    error_code::DISCONNECTED,
                    408,
                    format!("No activity seen from realtime in {idle_ms}ms; assuming connection has dropped"),
                )),
                now,
            );
        }
        let (expired, live): (Vec<_>, Vec<_>) = self.pings.drain(..).partition(|p| p.deadline <= now);
        self.pings = live;
        for ping in expired {
            let _ = ping.reply.send(Err(ErrorInfo::new(
                error_code::TIMEOUT,
                500,
                "Timeout waiting for heartbeat response",
            )));
        }
    }

    // ---- diagnostics ----

    pub(crate) fn transport_state(&self) -> TransportState {
        TransportState {
            active: self.active.as_ref().map(|a| (a.name.clone(), a.host.clone())),
            pending: self
                .pending
                .iter()
                .map(|s| (s.name.clone(), s.host.clone()))
                .collect(),
            preference: self.preference.clone(),
        }
    }

    pub(crate) fn connection_details(&self) -> ConnectionInternals {
        ConnectionInternals {
            id: self.connection_id.clone(),
            key: self.connection_key.clone(),
            msg_serial: self.msg_serial,
            connection_serial: self.connection_serial,
        }
    }

    /// Drops every transport as if the network had failed.
    pub(crate) fn force_disconnect(&mut self, reason: Option<ErrorInfo>, now: Instant) {
        if self.active.is_none() && self.pending.is_empty() {
            return;
        }
        self.disconnect_all_transports();
        self.on_transport_failure(reason, now);
    }

    /// Feeds a frame through the active transport's inbound path.
    pub(crate) fn inject(&mut self, msg: ProtocolMessage, now: Instant) {
        if let Some(id) = self.active.as_ref().map(|a| a.id) {
            self.on_protocol_message(id, msg, now);
        }
    }
}

impl ConnectionContext for ConnectionManager {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn error(&self) -> ErrorInfo {
        match ErrorInfo::for_connection_state(self.state) {
            Some(default) => self.error_reason.clone().unwrap_or(default),
            None => ErrorInfo::unknown_connection(),
        }
    }

    fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    fn format(&self) -> Format {
        self.config.format
    }

    fn send(&mut self, msg: ProtocolMessage, completions: Vec<Completion>) {
        if self.state == ConnectionState::Connected && self.active.is_some() {
            self.send_now(msg, completions);
        } else if self.state.queue_events() && self.config.queue_messages {
            debug!(action = msg.action, "queueing message until connected");
            self.queued.push_back(Outbound { msg, completions });
        } else {
            let err = self.error();
            for c in completions {
                c.complete(Err(err.clone()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
