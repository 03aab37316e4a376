//! Presence member tracking and SYNC reconciliation.
//!
//! [`PresenceMap`] holds the latest event per member and applies the ordering
//! rules; [`PresenceState`] is the per-channel controller owned by the event
//! loop. Everything here is synchronous; the channel decides what gets sent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::connection::Completion;
use crate::emitter::EventEmitter;
use crate::error::{ErrorInfo, error_code};
use crate::protocol::WirePresenceMessage;
use crate::types::{PresenceAction, PresenceMessage, now_millis};

/// Filters and sync behaviour for a presence `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceGetParams {
    /// Wait for an in-progress SYNC to finish before answering.
    pub wait_for_sync: bool,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
}

impl Default for PresenceGetParams {
    fn default() -> Self {
        Self {
            wait_for_sync: true,
            client_id: None,
            connection_id: None,
        }
    }
}

pub(crate) type MembersReply = oneshot::Sender<Result<Vec<PresenceMessage>, ErrorInfo>>;

/// A `get` waiting for the current SYNC to complete.
pub(crate) struct PendingGet {
    pub(crate) params: PresenceGetParams,
    pub(crate) reply: MembersReply,
}

/// An outbound presence event queued until the channel attaches.
pub(crate) struct PendingPresence {
    pub(crate) message: WirePresenceMessage,
    pub(crate) completion: Completion,
}

// ---------------------------------------------------------------------------
// PresenceMap
// ---------------------------------------------------------------------------

/// True when `item` supersedes `existing`.
///
/// Synthesized events compare by timestamp (ties go to the newcomer); events
/// from the same connection compare by `(msgSerial, index)` from their ids.
pub(crate) fn newer_than(item: &PresenceMessage, existing: &PresenceMessage) -> bool {
    if item.is_synthesized() || existing.is_synthesized() {
        return item.timestamp >= existing.timestamp;
    }
    match (item.parse_id(), existing.parse_id()) {
        (Some((serial, index)), Some((existing_serial, existing_index))) => {
            if serial == existing_serial {
                index > existing_index
            } else {
                serial > existing_serial
            }
        }
        // Unparseable ids fall back to arrival order.
        _ => item.timestamp >= existing.timestamp,
    }
}

fn by_member(item: &PresenceMessage) -> String {
    item.member_key()
}

fn by_client_id(item: &PresenceMessage) -> String {
    item.client_id.clone()
}

pub(crate) struct PresenceMap {
    map: HashMap<String, PresenceMessage>,
    residual: Option<HashMap<String, PresenceMessage>>,
    sync_in_progress: bool,
    key: fn(&PresenceMessage) -> String,
}

impl PresenceMap {
    /// Keyed by `clientId:connectionId`.
    pub(crate) fn members() -> Self {
        Self::with_key(by_member)
    }

    /// Keyed by client id; tracks members this connection entered.
    pub(crate) fn own_members() -> Self {
        Self::with_key(by_client_id)
    }

    fn with_key(key: fn(&PresenceMessage) -> String) -> Self {
        Self {
            map: HashMap::new(),
            residual: None,
            sync_in_progress: false,
            key,
        }
    }

    pub(crate) fn sync_in_progress(&self) -> bool {
        self.sync_in_progress
    }

    /// Present members matching the optional filters.
    pub(crate) fn list(&self, client_id: Option<&str>, connection_id: Option<&str>) -> Vec<PresenceMessage> {
        self.map
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .filter(|m| client_id.is_none_or(|c| m.client_id == c))
            .filter(|m| connection_id.is_none_or(|c| m.connection_id == c))
            .cloned()
            .collect()
    }

    pub(crate) fn values(&self) -> Vec<PresenceMessage> {
        self.list(None, None)
    }

    /// Stores an enter/update/present as `present`. Returns false when an
    /// equal-or-newer event for the member is already held.
    pub(crate) fn put(&mut self, item: &PresenceMessage) -> bool {
        let key = (self.key)(item);
        if let Some(residual) = self.residual.as_mut() {
            residual.remove(&key);
        }
        if let Some(existing) = self.map.get(&key)
            && !newer_than(item, existing)
        {
            return false;
        }
        let mut stored = item.clone();
        if matches!(stored.action, PresenceAction::Enter | PresenceAction::Update) {
            stored.action = PresenceAction::Present;
        }
        self.map.insert(key, stored);
        true
    }

    /// Applies a leave. During a SYNC the member is kept as `absent` so a
    /// stale `present` later in the sync cannot resurrect it.
    pub(crate) fn remove(&mut self, item: &PresenceMessage) -> bool {
        let key = (self.key)(item);
        let existed = match self.map.get(&key) {
            Some(existing) if !newer_than(item, existing) => return false,
            Some(_) => true,
            None => false,
        };
        if self.sync_in_progress {
            let mut absent = item.clone();
            absent.action = PresenceAction::Absent;
            self.map.insert(key, absent);
        } else {
            self.map.remove(&key);
        }
        existed
    }

    pub(crate) fn start_sync(&mut self) {
        if !self.sync_in_progress {
            self.residual = Some(self.map.clone());
            self.sync_in_progress = true;
        }
    }

    /// Ends a SYNC, returning the members that were not seen during it.
    /// They are removed from the map.
    pub(crate) fn end_sync(&mut self) -> Vec<PresenceMessage> {
        if !self.sync_in_progress {
            return Vec::new();
        }
        self.map.retain(|_, m| m.action != PresenceAction::Absent);
        let residual = self.residual.take().unwrap_or_default();
        for key in residual.keys() {
            self.map.remove(key);
        }
        self.sync_in_progress = false;
        residual.into_values().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
        self.residual = None;
        self.sync_in_progress = false;
    }
}

// ---------------------------------------------------------------------------
// PresenceState
// ---------------------------------------------------------------------------

/// Presence controller for one channel.
pub(crate) struct PresenceState {
    members: PresenceMap,
    own: PresenceMap,
    pending: Vec<PendingPresence>,
    sync_waiters: Vec<PendingGet>,
    events: Arc<EventEmitter<PresenceMessage>>,
}

/// Extracts the cursor from a `{sequenceId}:{cursor}` sync serial.
fn sync_cursor(sync_channel_serial: Option<&str>) -> Option<&str> {
    let serial = sync_channel_serial?;
    let (sequence, cursor) = serial.split_once(':')?;
    let valid = !sequence.is_empty()
        && sequence
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
    valid.then_some(cursor)
}

impl PresenceState {
    pub(crate) fn new(events: Arc<EventEmitter<PresenceMessage>>) -> Self {
        Self {
            members: PresenceMap::members(),
            own: PresenceMap::own_members(),
            pending: Vec::new(),
            sync_waiters: Vec::new(),
            events,
        }
    }

    pub(crate) fn sync_complete(&self) -> bool {
        !self.members.sync_in_progress()
    }

    #[cfg(test)]
    pub(crate) fn members(&self) -> &PresenceMap {
        &self.members
    }

    /// Applies a PRESENCE or SYNC batch and broadcasts the events that
    /// changed the member set. Returns true when a SYNC sequence finished.
    pub(crate) fn set_presence(
        &mut self,
        items: Vec<PresenceMessage>,
        is_sync: bool,
        sync_channel_serial: Option<&str>,
        own_connection_id: Option<&str>,
    ) -> bool {
        let mut cursor_pending = false;
        if is_sync {
            self.members.start_sync();
            cursor_pending = sync_cursor(sync_channel_serial).is_some_and(|c| !c.is_empty());
        }

        let mut broadcast = Vec::new();
        for item in items {
            let own = own_connection_id == Some(item.connection_id.as_str());
            match item.action {
                PresenceAction::Leave => {
                    if own && !item.is_synthesized() {
                        self.own.remove(&item);
                    }
                    if self.members.remove(&item) {
                        broadcast.push(item);
                    }
                }
                PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                    if own {
                        self.own.put(&item);
                    }
                    if self.members.put(&item) {
                        broadcast.push(item);
                    }
                }
                PresenceAction::Absent => {}
            }
        }

        let mut finished = false;
        if is_sync && !cursor_pending {
            self.end_sync();
            finished = true;
        }

        for item in &broadcast {
            self.events.emit(item.action.as_str(), item);
        }
        finished
    }

    fn end_sync(&mut self) {
        let departed = self.members.end_sync();
        self.synthesize_leaves(departed);
        let members = &self.members;
        for waiter in self.sync_waiters.drain(..) {
            let list = members.list(
                waiter.params.client_id.as_deref(),
                waiter.params.connection_id.as_deref(),
            );
            let _ = waiter.reply.send(Ok(list));
        }
    }

    fn synthesize_leaves(&self, departed: Vec<PresenceMessage>) {
        let now = now_millis();
        for mut member in departed {
            member.action = PresenceAction::Leave;
            member.timestamp = now;
            self.events.emit(PresenceAction::Leave.as_str(), &member);
        }
    }

    /// Handles an ATTACHED. Returns the members this connection had entered,
    /// which the channel re-enters on the new attachment.
    pub(crate) fn on_attached(&mut self, has_presence: bool) -> Vec<PresenceMessage> {
        if has_presence {
            self.members.start_sync();
        } else {
            let departed = self.members.values();
            self.members.clear();
            self.synthesize_leaves(departed);
            let members = &self.members;
            for waiter in self.sync_waiters.drain(..) {
                let _ = waiter.reply.send(Ok(members.list(
                    waiter.params.client_id.as_deref(),
                    waiter.params.connection_id.as_deref(),
                )));
            }
        }
        self.own.values()
    }

    pub(crate) fn queue(&mut self, message: WirePresenceMessage, completion: Completion) {
        self.pending.push(PendingPresence {
            message,
            completion,
        });
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingPresence> {
        std::mem::take(&mut self.pending)
    }

    /// Channel became detached or failed: all presence state is dropped.
    pub(crate) fn on_detached(&mut self, reason: &ErrorInfo) {
        self.own.clear();
        self.members.clear();
        self.fail_pending(reason);
        for waiter in self.sync_waiters.drain(..) {
            let _ = waiter.reply.send(Err(reason.clone()));
        }
    }

    /// Channel became suspended: members are kept but may be stale.
    pub(crate) fn on_suspended(&mut self, reason: &ErrorInfo) {
        self.fail_pending(reason);
        for waiter in self.sync_waiters.drain(..) {
            let _ = waiter.reply.send(Err(out_of_sync()));
        }
    }

    fn fail_pending(&mut self, reason: &ErrorInfo) {
        for pending in self.pending.drain(..) {
            pending.completion.complete(Err(reason.clone()));
        }
    }

    /// Answers a `get` now, or parks it until the SYNC completes.
    pub(crate) fn get(&mut self, request: PendingGet) {
        if request.params.wait_for_sync && !self.sync_complete() {
            self.sync_waiters.push(request);
            return;
        }
        let list = self.members.list(
            request.params.client_id.as_deref(),
            request.params.connection_id.as_deref(),
        );
        let _ = request.reply.send(Ok(list));
    }
}

pub(crate) fn out_of_sync() -> ErrorInfo {
    ErrorInfo::new(
        error_code::PRESENCE_OUT_OF_SYNC,
        400,
        "Presence state is out of sync due to channel being in the SUSPENDED state",
    )
}
