//! Hooks for inspecting and disturbing a live client from tests.

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::channel::ChannelRegistry;
use crate::connection::ConnectionManager;
pub use crate::connection::{ConnectionInternals, TransportState};
use crate::error::{Error, ErrorInfo};
use crate::protocol::ProtocolMessage;
use crate::realtime::Command;
use crate::types::ChannelState;

pub(crate) enum DiagnosticCommand {
    Transports(oneshot::Sender<TransportState>),
    Connection(oneshot::Sender<ConnectionInternals>),
    Disconnect(Option<ErrorInfo>),
    Inject(Box<ProtocolMessage>),
    ChannelState {
        channel: String,
        state: ChannelState,
        reason: Option<ErrorInfo>,
    },
}

impl DiagnosticCommand {
    pub(crate) fn apply(self, manager: &mut ConnectionManager, registry: &mut ChannelRegistry, now: Instant) {
        match self {
            DiagnosticCommand::Transports(reply) => {
                let _ = reply.send(manager.transport_state());
            }
            DiagnosticCommand::Connection(reply) => {
                let _ = reply.send(manager.connection_details());
            }
            DiagnosticCommand::Disconnect(reason) => manager.force_disconnect(reason, now),
            DiagnosticCommand::Inject(msg) => manager.inject(*msg, now),
            DiagnosticCommand::ChannelState {
                channel,
                state,
                reason,
            } => match registry.get_mut(&channel) {
                Some(core) => {
                    debug!(channel, from = %core.state(), to = %state, "forcing channel state");
                    core.force_state(state, reason, manager, now);
                }
                None => debug!(channel, "cannot force state of unknown channel"),
            },
        }
    }
}

/// Test hooks, from [`crate::Realtime::diagnostics`].
#[derive(Clone)]
pub struct Diagnostics {
    commands: mpsc::UnboundedSender<Command>,
}

impl Diagnostics {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    fn send(&self, cmd: DiagnosticCommand) -> Result<(), Error> {
        self.commands
            .send(Command::Diagnostic(cmd))
            .map_err(|_| Error::Closed)
    }

    /// Active and pending transports as `(name, host)` pairs.
    pub async fn transport_state(&self) -> Result<TransportState, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(DiagnosticCommand::Transports(tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub async fn connection_details(&self) -> Result<ConnectionInternals, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(DiagnosticCommand::Connection(tx))?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Drops all transports as if the network had gone away.
    pub fn force_disconnect(&self, reason: Option<ErrorInfo>) -> Result<(), Error> {
        self.send(DiagnosticCommand::Disconnect(reason))
    }

    /// Handles `msg` as if the active transport had received it.
    pub fn emit_inbound(&self, msg: ProtocolMessage) -> Result<(), Error> {
        self.send(DiagnosticCommand::Inject(Box::new(msg)))
    }

    /// Drives a channel into `state` without involving the service.
    pub fn force_channel_state(
        &self,
        channel: &str,
        state: ChannelState,
        reason: Option<ErrorInfo>,
    ) -> Result<(), Error> {
        self.send(DiagnosticCommand::ChannelState {
            channel: channel.to_string(),
            state,
            reason,
        })
    }
}
