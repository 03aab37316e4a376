//! Channel state machine and the registry that routes frames to channels.
//!
//! Channels never touch the network directly. Everything they send goes
//! through a [`ConnectionContext`], which the connection manager implements
//! and the unit tests fake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::retry_time;
use crate::codec::ChannelCodec;
use crate::connection::Completion;
use crate::emitter::EventEmitter;
use crate::error::{ErrorInfo, error_code};
use crate::options::{ChannelMode, ChannelOptions};
use crate::presence::{PendingGet, PresenceState, out_of_sync};
use crate::protocol::{
    self, ChannelFrame, Format, Inbound, ProtocolMessage, WireAnnotation, WireMessage,
    WirePresenceMessage, flags,
};
use crate::types::{
    Annotation, AnnotationAction, ChannelState, ChannelStateChange, ConnectionState, Data,
    Message, PresenceAction, PresenceMessage,
};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// What a channel needs from the connection it rides on.
pub(crate) trait ConnectionContext {
    fn state(&self) -> ConnectionState;
    /// Reason surfaced when an operation is refused because of the connection.
    fn error(&self) -> ErrorInfo;
    fn connection_id(&self) -> Option<&str>;
    fn client_id(&self) -> Option<&str>;
    fn format(&self) -> Format;
    /// Sends now, queues, or fails `completions`, depending on connection state.
    fn send(&mut self, msg: ProtocolMessage, completions: Vec<Completion>);
}

/// Notifications from the connection manager to the channels.
#[derive(Debug)]
pub(crate) enum ChannelSignal {
    /// A transport became active; pending operations are re-sent.
    TransportActive { reason: Option<ErrorInfo> },
    /// The connection left the states in which channels can stay attached.
    Interrupted {
        state: ConnectionState,
        reason: ErrorInfo,
    },
    /// A frame addressed to a channel.
    Frame(Inbound),
    /// Channel serials restored from a recovery key.
    Recover(HashMap<String, String>),
}

// ---------------------------------------------------------------------------
// State shared with handles
// ---------------------------------------------------------------------------

/// Channel properties readable from any handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSnapshot {
    pub state: ChannelState,
    pub error_reason: Option<ErrorInfo>,
    pub attach_serial: Option<String>,
    pub channel_serial: Option<String>,
    /// Modes granted by the last ATTACHED.
    pub modes: Vec<ChannelMode>,
    pub params: HashMap<String, String>,
}

/// Listener registries and the latest snapshot of one channel.
pub(crate) struct ChannelShared {
    pub(crate) name: String,
    pub(crate) state_events: EventEmitter<ChannelStateChange>,
    pub(crate) messages: EventEmitter<Message>,
    pub(crate) presence: Arc<EventEmitter<PresenceMessage>>,
    pub(crate) annotations: EventEmitter<Annotation>,
    snapshot: Mutex<ChannelSnapshot>,
}

impl ChannelShared {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state_events: EventEmitter::new(),
            messages: EventEmitter::new(),
            presence: Arc::new(EventEmitter::new()),
            annotations: EventEmitter::new(),
            snapshot: Mutex::new(ChannelSnapshot::default()),
        }
    }

    pub(crate) fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, snapshot: ChannelSnapshot) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

/// Channel handles registered by name; shared between the client and the
/// event loop.
pub(crate) type SharedChannels = Arc<Mutex<HashMap<String, Arc<ChannelShared>>>>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelTimeouts {
    pub(crate) request: Duration,
    pub(crate) retry: Duration,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A state transition with the flags carried by ATTACHED.
#[derive(Debug, Default)]
struct Transition {
    reason: Option<ErrorInfo>,
    resumed: bool,
    has_backlog: bool,
    has_presence: bool,
}

impl Transition {
    fn because(reason: Option<ErrorInfo>) -> Self {
        Self {
            reason,
            ..Default::default()
        }
    }
}

pub(crate) struct ChannelCore {
    shared: Arc<ChannelShared>,
    options: ChannelOptions,
    codec: ChannelCodec,
    timeouts: ChannelTimeouts,

    state: ChannelState,
    error_reason: Option<ErrorInfo>,
    attach_resume: bool,
    channel_serial: Option<String>,
    attach_serial: Option<String>,
    sync_channel_serial: Option<String>,
    modes: i32,
    params: HashMap<String, String>,

    state_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,
    retry_count: u32,

    decode_recovery: bool,
    /// Channel serial of the last MESSAGE that decoded cleanly.
    last_message_serial: Option<String>,

    attach_waiters: Vec<Completion>,
    detach_waiters: Vec<Completion>,
    pending_gets: Vec<PendingGet>,
    presence: PresenceState,
    released: bool,
}

impl ChannelCore {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        options: ChannelOptions,
        format: Format,
        timeouts: ChannelTimeouts,
    ) -> Self {
        let presence = PresenceState::new(Arc::clone(&shared.presence));
        Self {
            codec: ChannelCodec::new(&options, format),
            shared,
            options,
            timeouts,
            state: ChannelState::Initialized,
            error_reason: None,
            attach_resume: false,
            channel_serial: None,
            attach_serial: None,
            sync_channel_serial: None,
            modes: 0,
            params: HashMap::new(),
            state_deadline: None,
            retry_deadline: None,
            retry_count: 0,
            decode_recovery: false,
            last_message_serial: None,
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            pending_gets: Vec::new(),
            presence,
            released: false,
        }
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    fn invalid_state(&self) -> ErrorInfo {
        ErrorInfo::channel_invalid_state(self.name(), self.state)
    }

    fn publish_snapshot(&self) {
        self.shared.store(ChannelSnapshot {
            state: self.state,
            error_reason: self.error_reason.clone(),
            attach_serial: self.attach_serial.clone(),
            channel_serial: self.channel_serial.clone(),
            modes: ChannelMode::from_flags(self.modes),
            params: self.params.clone(),
        });
    }

    // ---- attach / detach ----

    pub(crate) fn attach(
        &mut self,
        completion: Option<Completion>,
        ctx: &mut dyn ConnectionContext,
        now: Instant,
    ) {
        if self.state == ChannelState::Attached {
            if let Some(c) = completion {
                c.complete(Ok(()));
            }
            return;
        }
        if !ctx.state().is_active() {
            if let Some(c) = completion {
                c.complete(Err(ctx.error()));
            }
            return;
        }
        self.attach_waiters.extend(completion);
        if self.state != ChannelState::Attaching {
            self.request_state(ChannelState::Attaching, None, ctx, now);
        }
    }

    /// Re-attaches even when attached, e.g. to recover from a decode failure.
    fn force_reattach(&mut self, reason: ErrorInfo, ctx: &mut dyn ConnectionContext, now: Instant) {
        if !ctx.state().is_active() {
            return;
        }
        self.request_state(ChannelState::Attaching, Some(reason), ctx, now);
    }

    pub(crate) fn detach(
        &mut self,
        completion: Completion,
        ctx: &mut dyn ConnectionContext,
        now: Instant,
    ) {
        if !ctx.state().is_active() {
            completion.complete(Err(ctx.error()));
            return;
        }
        match self.state {
            ChannelState::Initialized | ChannelState::Detached => completion.complete(Ok(())),
            ChannelState::Suspended => {
                self.notify_state(ChannelState::Detached, Transition::default(), ctx, now);
                completion.complete(Ok(()));
            }
            ChannelState::Failed => completion.complete(Err(ErrorInfo::new(
                error_code::CHANNEL_INVALID_STATE,
                400,
                "Unable to detach; channel state = failed",
            ))),
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Detaching => {
                self.detach_waiters.push(completion);
                if self.state != ChannelState::Detaching {
                    self.request_state(ChannelState::Detaching, None, ctx, now);
                }
            }
        }
    }

    fn request_state(
        &mut self,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        ctx: &mut dyn ConnectionContext,
        now: Instant,
    ) {
        self.notify_state(state, Transition::because(reason), ctx, now);
        self.check_pending_state(ctx, now);
    }

    /// Re-sends whatever the current transitional state is waiting on.
    fn check_pending_state(&mut self, ctx: &mut dyn ConnectionContext, now: Instant) {
        if ctx.state() != ConnectionState::Connected {
            debug!(channel = %self.name(), "connection not ready; deferring");
            return;
        }
        match self.state {
            ChannelState::Attaching => {
                self.start_state_timer(now);
                self.send_attach(ctx);
            }
            ChannelState::Detaching => {
                self.start_state_timer(now);
                ctx.send(protocol::build_detach_msg(self.name()), Vec::new());
            }
            ChannelState::Attached if !self.presence.sync_complete() => {
                ctx.send(
                    protocol::build_sync_msg(self.name(), self.sync_channel_serial.as_deref()),
                    Vec::new(),
                );
            }
            _ => {}
        }
    }

    fn send_attach(&mut self, ctx: &mut dyn ConnectionContext) {
        let serial = if self.decode_recovery {
            self.last_message_serial.as_deref()
        } else {
            self.channel_serial.as_deref()
        };
        let msg = protocol::build_attach_msg(
            self.name(),
            self.options.attach_params(),
            serial,
            self.options.mode_flags(),
            self.attach_resume,
        );
        ctx.send(msg, Vec::new());
    }

    fn start_state_timer(&mut self, now: Instant) {
        if self.state_deadline.is_none() {
            self.state_deadline = Some(now + self.timeouts.request);
        }
    }

    fn start_retry_timer(&mut self, now: Instant) {
        if self.retry_deadline.is_some() {
            return;
        }
        self.retry_count = self.retry_count.saturating_add(1);
        let delay = retry_time(self.timeouts.retry, self.retry_count);
        debug!(channel = %self.name(), ?delay, "scheduling channel re-attach");
        self.retry_deadline = Some(now + delay);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.state_deadline, self.retry_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn on_timer(&mut self, ctx: &mut dyn ConnectionContext, now: Instant) {
        if self.state_deadline.is_some_and(|d| d <= now) {
            self.state_deadline = None;
            self.timeout_pending_state(ctx, now);
        }
        if self.retry_deadline.is_some_and(|d| d <= now) {
            self.retry_deadline = None;
            if self.state == ChannelState::Suspended && ctx.state() == ConnectionState::Connected {
                self.request_state(ChannelState::Attaching, None, ctx, now);
            }
        }
    }

    fn timeout_pending_state(&mut self, ctx: &mut dyn ConnectionContext, now: Instant) {
        let timed_out = |what: &str| {
            ErrorInfo::new(error_code::CHANNEL_TIMEOUT, 408, format!("Channel {what} timed out"))
        };
        match self.state {
            ChannelState::Attaching => {
                warn!(channel = %self.name(), "attach timed out");
                let reason = timed_out("attach");
                self.notify_state(ChannelState::Suspended, Transition::because(Some(reason)), ctx, now);
            }
            ChannelState::Detaching => {
                warn!(channel = %self.name(), "detach timed out");
                let reason = timed_out("detach");
                self.notify_state(ChannelState::Attached, Transition::because(Some(reason)), ctx, now);
            }
            _ => self.check_pending_state(ctx, now),
        }
    }

    /// Applies a state change and notifies listeners and waiters.
    fn notify_state(
        &mut self,
        state: ChannelState,
        transition: Transition,
        ctx: &mut dyn ConnectionContext,
        now: Instant,
    ) {
        self.state_deadline = None;
        if matches!(
            state,
            ChannelState::Detached | ChannelState::Suspended | ChannelState::Failed
        ) {
            self.channel_serial = None;
        }
        if state == self.state {
            return;
        }

        let fallback = ErrorInfo::channel_invalid_state(self.name(), state);
        match state {
            ChannelState::Attached => self.presence_attached(transition.has_presence, ctx),
            ChannelState::Detached | ChannelState::Failed => {
                let reason = transition.reason.clone().unwrap_or(fallback);
                self.presence.on_detached(&reason);
            }
            ChannelState::Suspended => {
                let reason = transition.reason.clone().unwrap_or(fallback);
                self.presence.on_suspended(&reason);
            }
            _ => {}
        }

        if state == ChannelState::Suspended && ctx.state() == ConnectionState::Connected {
            self.start_retry_timer(now);
        } else {
            self.retry_deadline = None;
        }
        if let Some(reason) = &transition.reason {
            self.error_reason = Some(reason.clone());
        }
        if !matches!(state, ChannelState::Attaching | ChannelState::Suspended) {
            self.retry_count = 0;
        }
        match state {
            ChannelState::Attached => self.attach_resume = true,
            ChannelState::Detaching | ChannelState::Failed => self.attach_resume = false,
            _ => {}
        }
        if state != ChannelState::Attaching {
            self.decode_recovery = false;
        }

        let previous = self.state;
        self.state = state;
        info!(channel = %self.name(), from = %previous, to = %state, "channel state change");
        self.publish_snapshot();
        self.settle_waiters(state, transition.reason.as_ref(), ctx);

        let change = ChannelStateChange {
            previous,
            current: state,
            resumed: transition.resumed,
            has_backlog: transition.has_backlog,
            reason: transition.reason,
        };
        self.shared.state_events.emit(state.as_str(), &change);
    }

    fn settle_waiters(
        &mut self,
        state: ChannelState,
        reason: Option<&ErrorInfo>,
        ctx: &dyn ConnectionContext,
    ) {
        let failure = |op: &str| {
            reason.cloned().unwrap_or_else(|| {
                let e = ctx.error();
                if e.code == error_code::UNKNOWN_CONNECTION {
                    ErrorInfo::channel_operation_failed(
                        500,
                        format!("Unable to {op}; reason unknown; state = {state}"),
                    )
                } else {
                    e
                }
            })
        };
        let superseded = |op: &str, by: &str| {
            ErrorInfo::channel_operation_failed(
                409,
                format!("{op} request superseded by a subsequent {by} request"),
            )
        };

        match state {
            ChannelState::Attached => {
                for w in self.attach_waiters.drain(..) {
                    w.complete(Ok(()));
                }
                for get in self.pending_gets.drain(..) {
                    self.presence.get(get);
                }
            }
            ChannelState::Detached | ChannelState::Suspended | ChannelState::Failed => {
                let err = failure("attach");
                for w in self.attach_waiters.drain(..) {
                    w.complete(Err(err.clone()));
                }
                for get in self.pending_gets.drain(..) {
                    let _ = get.reply.send(Err(err.clone()));
                }
            }
            ChannelState::Detaching => {
                for w in self.attach_waiters.drain(..) {
                    w.complete(Err(superseded("Attach", "detach")));
                }
            }
            ChannelState::Attaching | ChannelState::Initialized => {}
        }

        match state {
            ChannelState::Detached => {
                for w in self.detach_waiters.drain(..) {
                    w.complete(Ok(()));
                }
            }
            ChannelState::Attached | ChannelState::Suspended | ChannelState::Failed => {
                let err = failure("detach");
                for w in self.detach_waiters.drain(..) {
                    w.complete(Err(err.clone()));
                }
            }
            ChannelState::Attaching => {
                for w in self.detach_waiters.drain(..) {
                    w.complete(Err(superseded("Detach", "attach")));
                }
            }
            ChannelState::Detaching | ChannelState::Initialized => {}
        }
    }

    // ---- presence on attach ----

    fn presence_attached(&mut self, has_presence: bool, ctx: &mut dyn ConnectionContext) {
        for member in self.presence.on_attached(has_presence) {
            let (data, encoding) = match self.codec.encode(&member.data) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(channel = %self.name(), client_id = %member.client_id, error = %e, "cannot re-encode presence data");
                    continue;
                }
            };
            let wire = WirePresenceMessage {
                id: member.id.clone(),
                action: PresenceAction::Enter.code(),
                client_id: Some(member.client_id.clone()),
                data,
                encoding,
                extras: member.extras.clone(),
                ..Default::default()
            };
            let shared = Arc::clone(&self.shared);
            let client_id = member.client_id;
            let on_done = Completion::new(move |result| {
                if let Err(e) = result {
                    error!(channel = %shared.name, %client_id, error = %e, "presence auto re-enter failed");
                    let change = ChannelStateChange {
                        previous: ChannelState::Attached,
                        current: ChannelState::Attached,
                        resumed: true,
                        has_backlog: false,
                        reason: Some(ErrorInfo::new(
                            error_code::PRESENCE_REENTER_FAILED,
                            e.status_code.unwrap_or(400),
                            format!("Presence auto re-enter failed for {client_id}: {}", e.message),
                        )),
                    };
                    shared.state_events.emit("update", &change);
                }
            });
            ctx.send(protocol::build_presence_msg(self.name(), vec![wire]), vec![on_done]);
        }

        let pending = self.presence.take_pending();
        if !pending.is_empty() {
            let (messages, completions): (Vec<_>, Vec<_>) =
                pending.into_iter().map(|p| (p.message, p.completion)).unzip();
            ctx.send(protocol::build_presence_msg(self.name(), messages), completions);
        }
    }

    // ---- publishing ----

    fn check_publishable(&self, ctx: &dyn ConnectionContext) -> Result<(), ErrorInfo> {
        if !ctx.state().is_active() {
            return Err(ctx.error());
        }
        if matches!(self.state, ChannelState::Failed | ChannelState::Suspended) {
            return Err(self.invalid_state());
        }
        Ok(())
    }

    pub(crate) fn publish(
        &mut self,
        messages: Vec<Message>,
        completion: Completion,
        ctx: &mut dyn ConnectionContext,
    ) {
        if let Err(e) = self.check_publishable(ctx) {
            completion.complete(Err(e));
            return;
        }
        let mut wire = Vec::with_capacity(messages.len());
        for m in messages {
            let (data, encoding) = match self.codec.encode(&m.data) {
                Ok(encoded) => encoded,
                Err(e) => {
                    completion.complete(Err(e));
                    return;
                }
            };
            wire.push(WireMessage {
                id: m.id,
                name: m.name,
                data,
                encoding,
                client_id: m.client_id,
                extras: m.extras,
                ..Default::default()
            });
        }
        ctx.send(protocol::build_message_msg(self.name(), wire), vec![completion]);
    }

    pub(crate) fn publish_annotation(
        &mut self,
        annotation: Annotation,
        completion: Completion,
        ctx: &mut dyn ConnectionContext,
    ) {
        if let Err(e) = self.check_publishable(ctx) {
            completion.complete(Err(e));
            return;
        }
        let (data, encoding) = self.codec.encode_unencrypted(&annotation.data);
        let wire = WireAnnotation {
            id: annotation.id,
            action: annotation.action.code(),
            message_serial: Some(annotation.message_serial),
            kind: Some(annotation.kind),
            name: annotation.name,
            count: annotation.count,
            data,
            encoding,
            client_id: annotation.client_id,
            ..Default::default()
        };
        ctx.send(protocol::build_annotation_msg(self.name(), vec![wire]), vec![completion]);
    }

    // ---- presence operations ----

    /// Enter, update or leave on behalf of `client_id` (or the connection's
    /// own client id when `None`).
    pub(crate) fn presence_action(
        &mut self,
        action: PresenceAction,
        client_id: Option<String>,
        data: Data,
        completion: Completion,
        ctx: &mut dyn ConnectionContext,
        now: Instant,
    ) {
        let verb = action.as_str();
        if client_id.is_none() {
            let anonymous = ctx.client_id().is_none_or(|c| c == "*");
            if anonymous && ctx.state() == ConnectionState::Connected {
                completion.complete(Err(ErrorInfo::new(
                    error_code::INVALID_CLIENT_ID,
                    400,
                    format!("clientId must be specified to {verb} a presence channel"),
                )));
                return;
            }
        }
        if !ctx.state().is_active() {
            completion.complete(Err(ctx.error()));
            return;
        }
        let (data, encoding) = match self.codec.encode(&data) {
            Ok(encoded) => encoded,
            Err(e) => {
                completion.complete(Err(e));
                return;
            }
        };
        let wire = WirePresenceMessage {
            action: action.code(),
            client_id: client_id.or_else(|| ctx.client_id().map(str::to_string)),
            data,
            encoding,
            ..Default::default()
        };

        if action == PresenceAction::Leave {
            match self.state {
                ChannelState::Attached => {
                    ctx.send(protocol::build_presence_msg(self.name(), vec![wire]), vec![completion]);
                }
                ChannelState::Attaching => self.presence.queue(wire, completion),
                ChannelState::Initialized | ChannelState::Failed => {
                    completion.complete(Err(ErrorInfo::new(
                        error_code::CHANNEL_INVALID_STATE,
                        400,
                        "Unable to leave presence channel (incompatible state)",
                    )));
                }
                _ => completion.complete(Err(self.invalid_state())),
            }
            return;
        }

        match self.state {
            ChannelState::Attached => {
                ctx.send(protocol::build_presence_msg(self.name(), vec![wire]), vec![completion]);
            }
            ChannelState::Initialized | ChannelState::Detached => {
                self.attach(None, ctx, now);
                self.presence.queue(wire, completion);
            }
            ChannelState::Attaching => self.presence.queue(wire, completion),
            state => completion.complete(Err(ErrorInfo::new(
                error_code::CHANNEL_INVALID_STATE,
                400,
                format!("Unable to {verb} presence channel while in {state} state"),
            ))),
        }
    }

    pub(crate) fn presence_get(
        &mut self,
        request: PendingGet,
        ctx: &mut dyn ConnectionContext,
        now: Instant,
    ) {
        match self.state {
            ChannelState::Suspended => {
                if request.params.wait_for_sync {
                    let _ = request.reply.send(Err(out_of_sync()));
                } else {
                    self.presence.get(request);
                }
            }
            ChannelState::Attached => self.presence.get(request),
            ChannelState::Initialized
            | ChannelState::Detached
            | ChannelState::Detaching
            | ChannelState::Attaching => {
                if !ctx.state().is_active() {
                    let _ = request.reply.send(Err(ctx.error()));
                    return;
                }
                self.pending_gets.push(request);
                self.attach(None, ctx, now);
            }
            ChannelState::Failed => {
                let _ = request.reply.send(Err(self.invalid_state()));
            }
        }
    }

    // ---- options ----

    /// Replaces the channel options, re-attaching when params or modes change.
    pub(crate) fn set_options(
        &mut self,
        options: ChannelOptions,
        completion: Completion,
        ctx: &mut dyn ConnectionContext,
    ) {
        let reattach = matches!(self.state, ChannelState::Attached | ChannelState::Attaching)
            && (options.attach_params() != self.options.attach_params()
                || options.mode_flags() != self.options.mode_flags());
        self.codec = ChannelCodec::new(&options, ctx.format());
        self.options = options;
        if reattach {
            self.attach_waiters.push(completion);
            self.send_attach(ctx);
        } else {
            completion.complete(Ok(()));
        }
    }

    // ---- inbound ----

    pub(crate) fn on_frame(&mut self, frame: Inbound, ctx: &mut dyn ConnectionContext, now: Instant) {
        match frame {
            Inbound::Attached(attached) => {
                if let Some(serial) = &attached.channel_serial {
                    self.channel_serial = Some(serial.clone());
                }
                self.attach_serial = attached.channel_serial.clone();
                self.modes = attached.flags;
                self.params = attached.params.clone().unwrap_or_default();
                let transition = Transition {
                    reason: attached.error.clone(),
                    resumed: attached.has_flag(flags::RESUMED),
                    has_backlog: attached.has_flag(flags::HAS_BACKLOG),
                    has_presence: attached.has_flag(flags::HAS_PRESENCE),
                };
                match self.state {
                    ChannelState::Attached => {
                        if !transition.resumed {
                            self.presence_attached(transition.has_presence, ctx);
                            let change = ChannelStateChange {
                                previous: ChannelState::Attached,
                                current: ChannelState::Attached,
                                resumed: false,
                                has_backlog: transition.has_backlog,
                                reason: transition.reason,
                            };
                            self.shared.state_events.emit("update", &change);
                        }
                        for w in self.attach_waiters.drain(..) {
                            w.complete(Ok(()));
                        }
                    }
                    ChannelState::Detaching => self.check_pending_state(ctx, now),
                    _ => self.notify_state(ChannelState::Attached, transition, ctx, now),
                }
            }
            Inbound::Detached { error, .. } => {
                let reason = error.unwrap_or_else(|| {
                    ErrorInfo::new(error_code::CHANNEL_INVALID_STATE, 404, "Channel detached")
                });
                match self.state {
                    ChannelState::Detaching => {
                        self.notify_state(ChannelState::Detached, Transition::because(Some(reason)), ctx, now);
                    }
                    ChannelState::Attaching => {
                        self.notify_state(ChannelState::Suspended, Transition::because(Some(reason)), ctx, now);
                    }
                    ChannelState::Attached | ChannelState::Suspended => {
                        self.request_state(ChannelState::Attaching, Some(reason), ctx, now);
                    }
                    _ => debug!(channel = %self.name(), state = %self.state, "ignoring DETACHED"),
                }
            }
            Inbound::Sync(frame) => {
                self.sync_channel_serial = frame.channel_serial.clone();
                self.on_presence(frame, true, ctx);
            }
            Inbound::Presence(frame) => {
                if let Some(serial) = &frame.channel_serial {
                    self.channel_serial = Some(serial.clone());
                }
                self.on_presence(frame, false, ctx);
            }
            Inbound::Message(frame) => {
                if let Some(serial) = &frame.channel_serial {
                    self.channel_serial = Some(serial.clone());
                }
                self.on_messages(frame, ctx, now);
            }
            Inbound::Annotation(frame) => self.on_annotations(frame),
            Inbound::Error { error, .. } => {
                let reason = error.unwrap_or_else(ErrorInfo::unknown_channel);
                if reason.code == error_code::SUPERSEDED_TRANSPORT {
                    self.check_pending_state(ctx, now);
                } else {
                    error!(channel = %self.name(), error = %reason, "channel error");
                    self.notify_state(ChannelState::Failed, Transition::because(Some(reason)), ctx, now);
                }
            }
            other => debug!(channel = %self.name(), action = other.name(), "ignoring frame"),
        }
        self.publish_snapshot();
    }

    fn on_presence(
        &mut self,
        frame: ChannelFrame<WirePresenceMessage>,
        is_sync: bool,
        ctx: &dyn ConnectionContext,
    ) {
        let ChannelFrame {
            id,
            connection_id,
            timestamp,
            items,
            ..
        } = frame;
        let mut members = Vec::with_capacity(items.len());
        for (i, wire) in items.into_iter().enumerate() {
            let Some(action) = PresenceAction::from_code(wire.action) else {
                warn!(channel = %self.name(), action = wire.action, "unknown presence action");
                continue;
            };
            let (data, encoding) = match self.codec.decode_detached(wire.data, wire.encoding) {
                Ok(data) => (data, None),
                Err(e) => {
                    error!(channel = %self.name(), error = %e.error, "presence decode failed");
                    (e.data, e.encoding)
                }
            };
            members.push(PresenceMessage {
                id: wire.id.or_else(|| id.as_ref().map(|pid| format!("{pid}:{i}"))),
                action,
                client_id: wire.client_id.unwrap_or_default(),
                connection_id: wire
                    .connection_id
                    .or_else(|| connection_id.clone())
                    .unwrap_or_default(),
                data,
                encoding,
                timestamp: wire.timestamp.or(timestamp).unwrap_or_default(),
                extras: wire.extras,
            });
        }
        let sync_serial = self.sync_channel_serial.clone();
        let finished = self.presence.set_presence(
            members,
            is_sync,
            sync_serial.as_deref(),
            ctx.connection_id(),
        );
        if finished {
            self.sync_channel_serial = None;
        }
    }

    fn on_messages(
        &mut self,
        frame: ChannelFrame<WireMessage>,
        ctx: &mut dyn ConnectionContext,
        now: Instant,
    ) {
        if self.state != ChannelState::Attached {
            debug!(channel = %self.name(), state = %self.state, "message received while not attached; discarding");
            return;
        }
        let ChannelFrame {
            id,
            connection_id,
            channel_serial,
            timestamp,
            items,
            ..
        } = frame;
        if let Some(first) = items.first()
            && let Err(reason) = self.codec.check_delta_reference(first)
        {
            error!(channel = %self.name(), error = %reason, "delta reference mismatch");
            self.start_decode_recovery(reason, ctx, now);
            return;
        }

        let mut decoded = Vec::with_capacity(items.len());
        for (i, wire) in items.into_iter().enumerate() {
            let (data, encoding) = match self.codec.decode(wire.data, wire.encoding) {
                Ok(data) => (data, None),
                Err(e) => match e.code() {
                    error_code::DELTA_DECODE_FAILED => {
                        error!(channel = %self.name(), error = %e.error, "delta decode failed");
                        self.start_decode_recovery(e.error, ctx, now);
                        return;
                    }
                    error_code::DELTA_DECODER_MISSING => {
                        error!(channel = %self.name(), error = %e.error, "no delta decoder");
                        self.notify_state(ChannelState::Failed, Transition::because(Some(e.error)), ctx, now);
                        return;
                    }
                    _ => {
                        error!(channel = %self.name(), error = %e.error, "message decode failed");
                        (e.data, e.encoding)
                    }
                },
            };
            decoded.push(Message {
                id: wire.id.or_else(|| id.as_ref().map(|pid| format!("{pid}:{i}"))),
                name: wire.name,
                data,
                encoding,
                client_id: wire.client_id,
                connection_id: wire.connection_id.or_else(|| connection_id.clone()),
                timestamp: wire.timestamp.or(timestamp),
                extras: wire.extras,
                serial: wire.serial,
            });
        }

        self.codec
            .set_last_message_id(decoded.last().and_then(|m| m.id.clone()));
        self.last_message_serial = channel_serial;
        for message in &decoded {
            self.shared
                .messages
                .emit(message.name.as_deref().unwrap_or_default(), message);
        }
    }

    fn on_annotations(&mut self, frame: ChannelFrame<WireAnnotation>) {
        for (i, wire) in frame.items.into_iter().enumerate() {
            let (data, encoding) = match self.codec.decode_detached(wire.data, wire.encoding) {
                Ok(data) => (data, None),
                Err(e) => {
                    error!(channel = %self.name(), error = %e.error, "annotation decode failed");
                    (e.data, e.encoding)
                }
            };
            let annotation = Annotation {
                id: wire
                    .id
                    .or_else(|| frame.id.as_ref().map(|pid| format!("{pid}:{i}"))),
                action: AnnotationAction::from_code(wire.action),
                message_serial: wire.message_serial.unwrap_or_default(),
                kind: wire.kind.unwrap_or_default(),
                name: wire.name,
                count: wire.count,
                data,
                encoding,
                client_id: wire.client_id,
                serial: wire.serial,
                timestamp: wire.timestamp.or(frame.timestamp),
            };
            self.shared.annotations.emit(&annotation.kind, &annotation);
        }
    }

    fn start_decode_recovery(&mut self, reason: ErrorInfo, ctx: &mut dyn ConnectionContext, now: Instant) {
        if self.decode_recovery || !ctx.state().is_active() {
            return;
        }
        warn!(channel = %self.name(), "starting decode failure recovery");
        self.codec.reset_delta();
        self.decode_recovery = true;
        self.force_reattach(reason, ctx, now);
    }

    // ---- connection-driven changes ----

    fn on_transport_active(&mut self, reason: Option<ErrorInfo>, ctx: &mut dyn ConnectionContext, now: Instant) {
        match self.state {
            ChannelState::Attaching | ChannelState::Detaching => self.check_pending_state(ctx, now),
            ChannelState::Suspended => self.attach(None, ctx, now),
            ChannelState::Attached => self.request_state(ChannelState::Attaching, reason, ctx, now),
            _ => {}
        }
    }

    fn on_interrupted(
        &mut self,
        connection: ConnectionState,
        reason: &ErrorInfo,
        ctx: &mut dyn ConnectionContext,
        now: Instant,
    ) {
        let target = match connection {
            ConnectionState::Closing | ConnectionState::Closed => ChannelState::Detached,
            ConnectionState::Failed => ChannelState::Failed,
            ConnectionState::Suspended => ChannelState::Suspended,
            _ => return,
        };
        if matches!(
            self.state,
            ChannelState::Attaching
                | ChannelState::Attached
                | ChannelState::Detaching
                | ChannelState::Suspended
        ) {
            self.notify_state(target, Transition::because(Some(reason.clone())), ctx, now);
        }
    }

    /// Forces a state, as if the service had driven the channel there.
    pub(crate) fn force_state(
        &mut self,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        ctx: &mut dyn ConnectionContext,
        now: Instant,
    ) {
        self.request_state(state, reason, ctx, now);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All channels of one client, keyed by name.
pub(crate) struct ChannelRegistry {
    channels: HashMap<String, ChannelCore>,
    shared: SharedChannels,
    timeouts: ChannelTimeouts,
}

impl ChannelRegistry {
    pub(crate) fn new(shared: SharedChannels, timeouts: ChannelTimeouts) -> Self {
        Self {
            channels: HashMap::new(),
            shared,
            timeouts,
        }
    }

    /// Registers a channel created by a handle, or updates the options of a
    /// channel the loop already knows.
    pub(crate) fn ensure(
        &mut self,
        shared: Arc<ChannelShared>,
        options: Option<ChannelOptions>,
        format: Format,
    ) {
        let timeouts = self.timeouts;
        let name = shared.name.clone();
        match self.channels.get_mut(&name) {
            Some(channel) => {
                if let Some(options) = options {
                    channel.codec = ChannelCodec::new(&options, format);
                    channel.options = options;
                }
                channel.released = false;
            }
            None => {
                let channel = ChannelCore::new(shared, options.unwrap_or_default(), format, timeouts);
                channel.publish_snapshot();
                self.channels.insert(name, channel);
            }
        }
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ChannelCore> {
        self.channels.get_mut(name)
    }

    pub(crate) fn on_signal(&mut self, signal: ChannelSignal, ctx: &mut dyn ConnectionContext, now: Instant) {
        match signal {
            ChannelSignal::TransportActive { reason } => {
                for channel in self.channels.values_mut() {
                    channel.on_transport_active(reason.clone(), ctx, now);
                }
            }
            ChannelSignal::Interrupted { state, reason } => {
                for channel in self.channels.values_mut() {
                    channel.on_interrupted(state, &reason, ctx, now);
                }
            }
            ChannelSignal::Frame(frame) => {
                let Some(name) = frame.channel().map(str::to_string) else {
                    return;
                };
                match self.channels.get_mut(&name) {
                    Some(channel) => channel.on_frame(frame, ctx, now),
                    None => warn!(channel = %name, action = frame.name(), "frame for unknown channel"),
                }
            }
            ChannelSignal::Recover(serials) => {
                for (name, serial) in serials {
                    let shared = self.shared_for(&name);
                    self.ensure(shared, None, ctx.format());
                    if let Some(channel) = self.channels.get_mut(&name) {
                        channel.channel_serial = Some(serial);
                        channel.publish_snapshot();
                    }
                }
            }
        }
        self.sweep_released();
    }

    fn shared_for(&self, name: &str) -> Arc<ChannelShared> {
        let mut map = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(ChannelShared::new(name))),
        )
    }

    /// Serials of attached channels, for building a recovery key.
    pub(crate) fn channel_serials(&self) -> HashMap<String, String> {
        self.channels
            .iter()
            .filter(|(_, c)| c.state == ChannelState::Attached)
            .filter_map(|(name, c)| c.channel_serial.clone().map(|s| (name.clone(), s)))
            .collect()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.channels.values().filter_map(ChannelCore::next_deadline).min()
    }

    pub(crate) fn on_timer(&mut self, ctx: &mut dyn ConnectionContext, now: Instant) {
        for channel in self.channels.values_mut() {
            channel.on_timer(ctx, now);
        }
        self.sweep_released();
    }

    /// Detaches if needed, then forgets the channel.
    pub(crate) fn release(&mut self, name: &str, ctx: &mut dyn ConnectionContext, now: Instant) {
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        channel.released = true;
        if matches!(
            channel.state,
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Detaching
        ) && ctx.state().is_active()
        {
            channel.detach(Completion::new(|_| {}), ctx, now);
        }
        self.sweep_released();
    }

    fn sweep_released(&mut self) {
        let done: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, c)| {
                c.released
                    && matches!(
                        c.state,
                        ChannelState::Initialized
                            | ChannelState::Detached
                            | ChannelState::Suspended
                            | ChannelState::Failed
                    )
            })
            .map(|(name, _)| name.clone())
            .collect();
        if done.is_empty() {
            return;
        }
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        for name in done {
            debug!(channel = %name, "channel released");
            if let Some(channel) = self.channels.remove(&name) {
                channel.shared.state_events.off_all();
                channel.shared.messages.off_all();
                channel.shared.presence.off_all();
                channel.shared.annotations.off_all();
            }
            shared.remove(&name);
        }
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, name: &str) -> Option<ChannelState> {
        self.channels.get(name).map(ChannelCore::state)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;
    use crate::emitter::EventFilter;
    use crate::presence::PresenceGetParams;
    use crate::protocol::{Attached, action};

    struct FakeContext {
        state: ConnectionState,
        sent: Vec<ProtocolMessage>,
        completions: Vec<Completion>,
        connection_id: Option<String>,
        client_id: Option<String>,
    }

    impl FakeContext {
        fn connected() -> Self {
            Self {
                state: ConnectionState::Connected,
                sent: Vec::new(),
                completions: Vec::new(),
                connection_id: Some("conn-1".to_string()),
                client_id: Some("me".to_string()),
            }
        }

        fn actions(&self) -> Vec<i32> {
            self.sent.iter().map(|m| m.action).collect()
        }

        fn last(&self) -> &ProtocolMessage {
            self.sent.last().unwrap()
        }
    }

    impl ConnectionContext for FakeContext {
        fn state(&self) -> ConnectionState {
            self.state
        }
        fn error(&self) -> ErrorInfo {
            ErrorInfo::for_connection_state(self.state).unwrap_or_else(ErrorInfo::unknown_connection)
        }
        fn connection_id(&self) -> Option<&str> {
            self.connection_id.as_deref()
        }
        fn client_id(&self) -> Option<&str> {
            self.client_id.as_deref()
        }
        fn format(&self) -> Format {
            Format::MsgPack
        }
        fn send(&mut self, msg: ProtocolMessage, completions: Vec<Completion>) {
            self.sent.push(msg);
            self.completions.extend(completions);
        }
    }

    const TIMEOUTS: ChannelTimeouts = ChannelTimeouts {
        request: Duration::from_secs(10),
        retry: Duration::from_secs(15),
    };

    fn channel(name: &str) -> ChannelCore {
        ChannelCore::new(
            Arc::new(ChannelShared::new(name)),
            ChannelOptions::default(),
            Format::MsgPack,
            TIMEOUTS,
        )
    }

    fn waiter() -> (Completion, oneshot::Receiver<Result<(), ErrorInfo>>) {
        let (tx, rx) = oneshot::channel();
        (Completion::reply(tx), rx)
    }

    fn attached(name: &str, flags: i32, serial: Option<&str>) -> Inbound {
        Inbound::Attached(Attached {
            channel: name.to_string(),
            channel_serial: serial.map(str::to_string),
            flags,
            params: None,
            error: None,
        })
    }

    fn message_frame(name: &str, id: &str, serial: &str, items: Vec<WireMessage>) -> Inbound {
        Inbound::Message(ChannelFrame {
            channel: name.to_string(),
            id: Some(id.to_string()),
            connection_id: Some("remote".to_string()),
            channel_serial: Some(serial.to_string()),
            timestamp: Some(1_700_000_000_000),
            items,
        })
    }

    fn states(ch: &ChannelCore) -> Arc<Mutex<Vec<(ChannelState, Option<i32>)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        ch.shared.state_events.on(EventFilter::Any, move |c: &ChannelStateChange| {
            s.lock().unwrap().push((c.current, c.reason.as_ref().map(|r| r.code)));
        });
        seen
    }

    fn attach_now(ch: &mut ChannelCore, ctx: &mut FakeContext, now: Instant) {
        ch.attach(None, ctx, now);
        let name = ch.name().to_string();
        ch.on_frame(attached(&name, 0, Some("s:0")), ctx, now);
        assert_eq!(ch.state(), ChannelState::Attached);
    }

    #[test]
    fn attach_sends_attach_and_resolves_on_attached() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("chat");
        let seen = states(&ch);
        let now = Instant::now();
        let (done, mut rx) = waiter();
        ch.attach(Some(done), &mut ctx, now);
        assert_eq!(ctx.actions(), vec![action::ATTACH]);
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert!(rx.try_recv().is_err());

        ch.on_frame(attached("chat", flags::RESUMED, Some("serial:1")), &mut ctx, now);
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ChannelState::Attaching, None), (ChannelState::Attached, None)]
        );
        assert_eq!(ch.shared.snapshot().attach_serial.as_deref(), Some("serial:1"));

        // Attaching again is immediate and sends nothing.
        let (done, mut rx) = waiter();
        ch.attach(Some(done), &mut ctx, now);
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(ctx.sent.len(), 1);
    }

    #[test]
    fn attach_requires_active_connection() {
        let mut ctx = FakeContext::connected();
        ctx.state = ConnectionState::Failed;
        let mut ch = channel("chat");
        let (done, mut rx) = waiter();
        ch.attach(Some(done), &mut ctx, Instant::now());
        assert_eq!(rx.try_recv().unwrap().unwrap_err().code, 80000);
        assert_eq!(ch.state(), ChannelState::Initialized);
    }

    #[test]
    fn attach_while_connecting_defers_attach_message() {
        let mut ctx = FakeContext::connected();
        ctx.state = ConnectionState::Connecting;
        let mut ch = channel("chat");
        let now = Instant::now();
        ch.attach(None, &mut ctx, now);
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert!(ctx.sent.is_empty());

        ctx.state = ConnectionState::Connected;
        ch.on_transport_active(None, &mut ctx, now);
        assert_eq!(ctx.actions(), vec![action::ATTACH]);
    }

    #[test]
    fn attach_timeout_suspends_then_retries() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("chat");
        let seen = states(&ch);
        let now = Instant::now();
        ch.attach(None, &mut ctx, now);
        let deadline = ch.next_deadline().unwrap();
        assert_eq!(deadline, now + TIMEOUTS.request);

        ch.on_timer(&mut ctx, deadline);
        assert_eq!(ch.state(), ChannelState::Suspended);
        assert_eq!(seen.lock().unwrap().last(), Some(&(ChannelState::Suspended, Some(90007))));

        let retry_at = ch.next_deadline().unwrap();
        assert!(retry_at >= deadline + Duration::from_secs(12));
        assert!(retry_at < deadline + TIMEOUTS.retry);
        ch.on_timer(&mut ctx, retry_at);
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert_eq!(ctx.actions(), vec![action::ATTACH, action::ATTACH]);
    }

    #[test]
    fn server_detach_while_attached_reattaches() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("chat");
        let now = Instant::now();
        attach_now(&mut ch, &mut ctx, now);
        ch.on_frame(
            Inbound::Detached {
                channel: "chat".to_string(),
                error: None,
            },
            &mut ctx,
            now,
        );
        assert_eq!(ch.state(), ChannelState::Attaching);
        let attach = ctx.last();
        assert_eq!(attach.action, action::ATTACH);
        assert!(attach.has_flag(flags::ATTACH_RESUME));
        assert_eq!(ch.error_reason.as_ref().map(|e| e.code), Some(90001));
    }

    #[test]
    fn detach_supersedes_pending_attach() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("chat");
        let now = Instant::now();
        let (attach_done, mut attach_rx) = waiter();
        ch.attach(Some(attach_done), &mut ctx, now);
        let (detach_done, mut detach_rx) = waiter();
        ch.detach(detach_done, &mut ctx, now);
        let err = attach_rx.try_recv().unwrap().unwrap_err();
        assert_eq!((err.code, err.status_code), (90000, Some(409)));
        assert_eq!(ctx.actions(), vec![action::ATTACH, action::DETACH]);

        ch.on_frame(
            Inbound::Detached {
                channel: "chat".to_string(),
                error: None,
            },
            &mut ctx,
            now,
        );
        assert!(detach_rx.try_recv().unwrap().is_ok());
        assert_eq!(ch.state(), ChannelState::Detached);
    }

    #[test]
    fn detach_edge_states() {
        let mut ctx = FakeContext::connected();
        let now = Instant::now();
        let mut ch = channel("a");
        let (done, mut rx) = waiter();
        ch.detach(done, &mut ctx, now);
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(ctx.sent.is_empty());

        ch.force_state(ChannelState::Failed, None, &mut ctx, now);
        let (done, mut rx) = waiter();
        ch.detach(done, &mut ctx, now);
        assert_eq!(rx.try_recv().unwrap().unwrap_err().code, 90001);

        let mut ch = channel("b");
        ch.force_state(ChannelState::Suspended, None, &mut ctx, now);
        let (done, mut rx) = waiter();
        ch.detach(done, &mut ctx, now);
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(ch.state(), ChannelState::Detached);
    }

    #[test]
    fn publish_refused_in_suspended_and_failed() {
        let mut ctx = FakeContext::connected();
        let now = Instant::now();
        let mut ch = channel("chat");
        ch.force_state(ChannelState::Suspended, None, &mut ctx, now);
        let (done, mut rx) = waiter();
        ch.publish(vec![Message::new("e", "x")], done, &mut ctx);
        assert_eq!(rx.try_recv().unwrap().unwrap_err().code, 90001);
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn publish_encodes_and_hands_completion_to_connection() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("chat");
        let (done, mut rx) = waiter();
        ch.publish(
            vec![Message::new("greeting", serde_json::json!({"hello": "world"}))],
            done,
            &mut ctx,
        );
        let sent = ctx.last();
        assert_eq!(sent.action, action::MESSAGE);
        let wire = &sent.messages.as_ref().unwrap()[0];
        assert_eq!(wire.encoding.as_deref(), Some("json"));
        ctx.completions.pop().unwrap().complete(Ok(()));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn messages_are_decoded_and_dispatched_by_name() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("chat");
        let now = Instant::now();
        attach_now(&mut ch, &mut ctx, now);
        let named = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(Mutex::new(Vec::new()));
        let n = Arc::clone(&named);
        ch.shared.messages.on("greeting", move |_: &Message| {
            n.fetch_add(1, Ordering::SeqCst);
        });
        let a = Arc::clone(&all);
        ch.shared.messages.on(EventFilter::Any, move |m: &Message| {
            a.lock().unwrap().push(m.clone());
        });

        ch.on_frame(
            message_frame(
                "chat",
                "remote:5",
                "s:1",
                vec![
                    WireMessage {
                        name: Some("greeting".to_string()),
                        data: crate::protocol::WireData::String("hi".to_string()),
                        ..Default::default()
                    },
                    WireMessage {
                        name: Some("other".to_string()),
                        ..Default::default()
                    },
                ],
            ),
            &mut ctx,
            now,
        );
        assert_eq!(named.load(Ordering::SeqCst), 1);
        let all = all.lock().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id.as_deref(), Some("remote:5:0"));
        assert_eq!(all[1].id.as_deref(), Some("remote:5:1"));
        assert_eq!(all[0].connection_id.as_deref(), Some("remote"));
        assert_eq!(all[0].timestamp, Some(1_700_000_000_000));
        assert_eq!(all[0].data, Data::String("hi".to_string()));
        assert_eq!(ch.shared.snapshot().channel_serial.as_deref(), Some("s:1"));
    }

    #[test]
    fn delta_gap_triggers_reattach_from_last_good_serial() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("deltas");
        let seen = states(&ch);
        let now = Instant::now();
        attach_now(&mut ch, &mut ctx, now);
        ch.on_frame(
            message_frame("deltas", "p:1", "good-serial", vec![WireMessage::default()]),
            &mut ctx,
            now,
        );
        let delta = WireMessage {
            extras: Some(serde_json::json!({"delta": {"from": "some-other-id"}})),
            ..Default::default()
        };
        ch.on_frame(message_frame("deltas", "p:2", "bad-serial", vec![delta]), &mut ctx, now);

        assert_eq!(ch.state(), ChannelState::Attaching);
        assert_eq!(seen.lock().unwrap().last(), Some(&(ChannelState::Attaching, Some(40018))));
        let attach = ctx.last();
        assert_eq!(attach.action, action::ATTACH);
        assert_eq!(attach.channel_serial.as_deref(), Some("good-serial"));

        ch.on_frame(attached("deltas", 0, Some("fresh")), &mut ctx, now);
        assert_eq!(ch.state(), ChannelState::Attached);
        assert!(!ch.decode_recovery);
    }

    #[test]
    fn delta_gap_while_connection_inactive_leaves_recovery_available() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("deltas");
        let now = Instant::now();
        attach_now(&mut ch, &mut ctx, now);
        let gap = || WireMessage {
            extras: Some(serde_json::json!({"delta": {"from": "some-other-id"}})),
            ..Default::default()
        };

        ctx.state = ConnectionState::Closing;
        ch.on_frame(message_frame("deltas", "p:1", "s1", vec![gap()]), &mut ctx, now);
        assert_eq!(ch.state(), ChannelState::Attached);
        assert!(!ch.decode_recovery);

        ctx.state = ConnectionState::Connected;
        ch.on_frame(message_frame("deltas", "p:2", "s2", vec![gap()]), &mut ctx, now);
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert!(ch.decode_recovery);
        assert_eq!(ctx.last().action, action::ATTACH);
    }

    #[test]
    fn vcdiff_without_decoder_fails_channel() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("deltas");
        let seen = states(&ch);
        let now = Instant::now();
        attach_now(&mut ch, &mut ctx, now);
        let delta = WireMessage {
            data: crate::protocol::WireData::Binary(vec![0xd6, 0xc3, 0xc4]),
            encoding: Some("vcdiff".to_string()),
            ..Default::default()
        };
        ch.on_frame(message_frame("deltas", "p:1", "s1", vec![delta]), &mut ctx, now);

        assert_eq!(ch.state(), ChannelState::Failed);
        assert_eq!(seen.lock().unwrap().last(), Some(&(ChannelState::Failed, Some(40019))));
        assert_eq!(ch.shared.snapshot().error_reason.map(|e| e.code), Some(40019));
    }

    #[test]
    fn channel_error_fails_channel_but_superseded_transport_resends() {
        let mut ctx = FakeContext::connected();
        let now = Instant::now();
        let mut ch = channel("chat");
        ch.attach(None, &mut ctx, now);
        ch.on_frame(
            Inbound::Error {
                channel: Some("chat".to_string()),
                error: Some(ErrorInfo::new(error_code::SUPERSEDED_TRANSPORT, 400, "superseded")),
            },
            &mut ctx,
            now,
        );
        assert_eq!(ch.state(), ChannelState::Attaching);
        assert_eq!(ctx.actions(), vec![action::ATTACH, action::ATTACH]);

        ch.on_frame(
            Inbound::Error {
                channel: Some("chat".to_string()),
                error: Some(ErrorInfo::new(error_code::CAPABILITY_DENIED, 401, "denied")),
            },
            &mut ctx,
            now,
        );
        assert_eq!(ch.state(), ChannelState::Failed);
        assert_eq!(ch.shared.snapshot().error_reason.map(|e| e.code), Some(40160));
    }

    #[test]
    fn enter_before_attach_is_queued_and_flushed() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("room");
        let now = Instant::now();
        let (first, mut first_rx) = waiter();
        let (second, mut second_rx) = waiter();
        ch.presence_action(PresenceAction::Enter, None, Data::from("hi"), first, &mut ctx, now);
        ch.presence_action(PresenceAction::Update, None, Data::from("again"), second, &mut ctx, now);
        assert_eq!(ctx.actions(), vec![action::ATTACH]);

        ch.on_frame(attached("room", 0, None), &mut ctx, now);
        let presence = ctx.last();
        assert_eq!(presence.action, action::PRESENCE);
        let items = presence.presence.as_ref().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].client_id.as_deref(), Some("me"));
        assert_eq!(ctx.completions.len(), 2);
        for c in ctx.completions.drain(..) {
            c.complete(Ok(()));
        }
        assert!(first_rx.try_recv().unwrap().is_ok());
        assert!(second_rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn anonymous_enter_is_rejected_when_connected() {
        let mut ctx = FakeContext::connected();
        ctx.client_id = None;
        let mut ch = channel("room");
        let (done, mut rx) = waiter();
        ch.presence_action(PresenceAction::Enter, None, Data::None, done, &mut ctx, Instant::now());
        assert_eq!(rx.try_recv().unwrap().unwrap_err().code, 40012);

        let (done, _rx) = waiter();
        ch.presence_action(
            PresenceAction::Enter,
            Some("explicit".to_string()),
            Data::None,
            done,
            &mut ctx,
            Instant::now(),
        );
        assert_eq!(ctx.actions(), vec![action::ATTACH]);
    }

    #[test]
    fn leave_in_initialized_state_is_refused() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("room");
        let (done, mut rx) = waiter();
        ch.presence_action(PresenceAction::Leave, None, Data::None, done, &mut ctx, Instant::now());
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.code, 90001);
        assert!(err.message.contains("incompatible state"));
    }

    #[test]
    fn presence_get_on_suspended_channel() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("room");
        let now = Instant::now();
        ch.force_state(ChannelState::Suspended, None, &mut ctx, now);
        let (tx, mut rx) = oneshot::channel();
        ch.presence_get(
            PendingGet {
                params: PresenceGetParams::default(),
                reply: tx,
            },
            &mut ctx,
            now,
        );
        assert_eq!(rx.try_recv().unwrap().unwrap_err().code, 91005);

        let (tx, mut rx) = oneshot::channel();
        ch.presence_get(
            PendingGet {
                params: PresenceGetParams {
                    wait_for_sync: false,
                    ..Default::default()
                },
                reply: tx,
            },
            &mut ctx,
            now,
        );
        assert!(rx.try_recv().unwrap().unwrap().is_empty());
    }

    #[test]
    fn presence_get_attaches_and_waits_for_sync() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("room");
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        ch.presence_get(
            PendingGet {
                params: PresenceGetParams::default(),
                reply: tx,
            },
            &mut ctx,
            now,
        );
        assert_eq!(ctx.actions(), vec![action::ATTACH]);
        ch.on_frame(attached("room", flags::HAS_PRESENCE, None), &mut ctx, now);
        assert!(rx.try_recv().is_err());

        ch.on_frame(
            Inbound::Sync(ChannelFrame {
                channel: "room".to_string(),
                id: Some("other:1".to_string()),
                connection_id: Some("other".to_string()),
                channel_serial: Some("seq:".to_string()),
                timestamp: Some(5),
                items: vec![WirePresenceMessage {
                    action: PresenceAction::Present.code(),
                    client_id: Some("alice".to_string()),
                    ..Default::default()
                }],
            }),
            &mut ctx,
            now,
        );
        let members = rx.try_recv().unwrap().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].client_id, "alice");
        assert_eq!(members[0].id.as_deref(), Some("other:1:0"));
    }

    #[test]
    fn reattach_without_resume_reenters_own_members() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("room");
        let now = Instant::now();
        attach_now(&mut ch, &mut ctx, now);
        ch.on_frame(
            Inbound::Presence(ChannelFrame {
                channel: "room".to_string(),
                id: Some("conn-1:3".to_string()),
                connection_id: Some("conn-1".to_string()),
                channel_serial: None,
                timestamp: Some(10),
                items: vec![WirePresenceMessage {
                    action: PresenceAction::Enter.code(),
                    client_id: Some("me".to_string()),
                    ..Default::default()
                }],
            }),
            &mut ctx,
            now,
        );
        let updates = Arc::new(Mutex::new(Vec::new()));
        let u = Arc::clone(&updates);
        ch.shared.state_events.on("update", move |c: &ChannelStateChange| {
            u.lock().unwrap().push(c.reason.as_ref().map(|r| r.code));
        });

        ch.on_frame(attached("room", 0, None), &mut ctx, now);
        let reenter = ctx.last();
        assert_eq!(reenter.action, action::PRESENCE);
        let item = &reenter.presence.as_ref().unwrap()[0];
        assert_eq!(item.action, PresenceAction::Enter.code());
        assert_eq!(item.id.as_deref(), Some("conn-1:3:0"));

        ctx.completions
            .pop()
            .unwrap()
            .complete(Err(ErrorInfo::new(error_code::CAPABILITY_DENIED, 401, "nope")));
        assert_eq!(*updates.lock().unwrap(), vec![None, Some(91004)]);
    }

    #[test]
    fn annotations_are_emitted_by_type() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("chat");
        let now = Instant::now();
        attach_now(&mut ch, &mut ctx, now);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        ch.shared.annotations.on("reaction:distinct.v1", move |a: &Annotation| {
            s.lock().unwrap().push(a.clone());
        });
        ch.on_frame(
            Inbound::Annotation(ChannelFrame {
                channel: "chat".to_string(),
                id: Some("x:1".to_string()),
                connection_id: None,
                channel_serial: None,
                timestamp: Some(9),
                items: vec![WireAnnotation {
                    action: 0,
                    message_serial: Some("msg-1".to_string()),
                    kind: Some("reaction:distinct.v1".to_string()),
                    name: Some("👍".to_string()),
                    ..Default::default()
                }],
            }),
            &mut ctx,
            now,
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message_serial, "msg-1");
        assert_eq!(seen[0].id.as_deref(), Some("x:1:0"));
    }

    #[test]
    fn registry_maps_connection_interruptions() {
        let shared: SharedChannels = Arc::default();
        let mut registry = ChannelRegistry::new(Arc::clone(&shared), TIMEOUTS);
        let mut ctx = FakeContext::connected();
        let now = Instant::now();
        for name in ["a", "b", "c"] {
            registry.ensure(Arc::new(ChannelShared::new(name)), None, Format::MsgPack);
        }
        registry.get_mut("a").unwrap().attach(None, &mut ctx, now);
        registry
            .get_mut("b")
            .unwrap()
            .on_frame(attached("b", 0, Some("b:1")), &mut ctx, now);
        assert_eq!(registry.state_of("b"), Some(ChannelState::Attached));

        ctx.state = ConnectionState::Suspended;
        registry.on_signal(
            ChannelSignal::Interrupted {
                state: ConnectionState::Suspended,
                reason: ErrorInfo::suspended(),
            },
            &mut ctx,
            now,
        );
        assert_eq!(registry.state_of("a"), Some(ChannelState::Suspended));
        assert_eq!(registry.state_of("b"), Some(ChannelState::Suspended));
        assert_eq!(registry.state_of("c"), Some(ChannelState::Initialized));

        ctx.state = ConnectionState::Closed;
        registry.on_signal(
            ChannelSignal::Interrupted {
                state: ConnectionState::Closed,
                reason: ErrorInfo::closed(),
            },
            &mut ctx,
            now,
        );
        assert_eq!(registry.state_of("a"), Some(ChannelState::Detached));
        assert_eq!(registry.state_of("c"), Some(ChannelState::Initialized));
    }

    #[test]
    fn registry_reattaches_on_transport_active_and_reports_serials() {
        let shared: SharedChannels = Arc::default();
        let mut registry = ChannelRegistry::new(shared, TIMEOUTS);
        let mut ctx = FakeContext::connected();
        let now = Instant::now();
        registry.ensure(Arc::new(ChannelShared::new("a")), None, Format::MsgPack);
        registry.get_mut("a").unwrap().attach(None, &mut ctx, now);
        registry.on_signal(ChannelSignal::Frame(attached("a", 0, Some("a:7"))), &mut ctx, now);
        assert_eq!(
            registry.channel_serials().get("a").map(String::as_str),
            Some("a:7")
        );

        ctx.sent.clear();
        registry.on_signal(ChannelSignal::TransportActive { reason: None }, &mut ctx, now);
        assert_eq!(registry.state_of("a"), Some(ChannelState::Attaching));
        assert_eq!(ctx.last().channel_serial.as_deref(), Some("a:7"));
    }

    #[test]
    fn recover_creates_channels_with_serials() {
        let shared: SharedChannels = Arc::default();
        let mut registry = ChannelRegistry::new(Arc::clone(&shared), TIMEOUTS);
        let mut ctx = FakeContext::connected();
        let serials = HashMap::from([("r".to_string(), "r:42".to_string())]);
        registry.on_signal(ChannelSignal::Recover(serials), &mut ctx, Instant::now());
        assert!(shared.lock().unwrap().contains_key("r"));
        registry.get_mut("r").unwrap().attach(None, &mut ctx, Instant::now());
        assert_eq!(ctx.last().channel_serial.as_deref(), Some("r:42"));
    }

    #[test]
    fn release_detaches_then_forgets() {
        let shared: SharedChannels = Arc::default();
        let mut registry = ChannelRegistry::new(Arc::clone(&shared), TIMEOUTS);
        let mut ctx = FakeContext::connected();
        let now = Instant::now();
        let handle = Arc::new(ChannelShared::new("gone"));
        shared.lock().unwrap().insert("gone".to_string(), Arc::clone(&handle));
        registry.ensure(handle, None, Format::MsgPack);
        registry.get_mut("gone").unwrap().attach(None, &mut ctx, now);
        registry.on_signal(ChannelSignal::Frame(attached("gone", 0, None)), &mut ctx, now);

        registry.release("gone", &mut ctx, now);
        assert_eq!(registry.state_of("gone"), Some(ChannelState::Detaching));
        registry.on_signal(
            ChannelSignal::Frame(Inbound::Detached {
                channel: "gone".to_string(),
                error: None,
            }),
            &mut ctx,
            now,
        );
        assert_eq!(registry.state_of("gone"), None);
        assert!(!shared.lock().unwrap().contains_key("gone"));
    }

    #[test]
    fn frames_for_unknown_channels_are_ignored() {
        let mut registry = ChannelRegistry::new(Arc::default(), TIMEOUTS);
        let mut ctx = FakeContext::connected();
        registry.on_signal(ChannelSignal::Frame(attached("nobody", 0, None)), &mut ctx, Instant::now());
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn set_options_reattaches_when_params_change() {
        let mut ctx = FakeContext::connected();
        let mut ch = channel("chat");
        let now = Instant::now();
        attach_now(&mut ch, &mut ctx, now);
        let (done, mut rx) = waiter();
        ch.set_options(
            ChannelOptions {
                params: HashMap::from([("rewind".to_string(), "1".to_string())]),
                ..Default::default()
            },
            done,
            &mut ctx,
        );
        let attach = ctx.last();
        assert_eq!(attach.action, action::ATTACH);
        assert_eq!(
            attach.params.as_ref().and_then(|p| p.get("rewind")).map(String::as_str),
            Some("1")
        );
        assert!(rx.try_recv().is_err());
        ch.on_frame(attached("chat", flags::RESUMED, None), &mut ctx, now);
        assert!(rx.try_recv().unwrap().is_ok());

        // Same params again: nothing to renegotiate.
        let sent_before = ctx.sent.len();
        let (done, mut rx) = waiter();
        ch.set_options(
            ChannelOptions {
                params: HashMap::from([("rewind".to_string(), "1".to_string())]),
                ..Default::default()
            },
            done,
            &mut ctx,
        );
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(ctx.sent.len(), sent_before);
    }
}
