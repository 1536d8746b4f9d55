//! Per-flow state.
//!
//! A flow binds one key to its reassembly state, its callback, and the user context handed back
//! on every invocation. Flows are owned by their session's table and never lent out mutably.

use super::timerwheel::TimerId;
use super::Reassembly;
use crate::dispatch::{Callback, FlowEvent, FlowId, Reason};
use crate::error::FlowError;

use std::time::Instant;

use serde::Serialize;

pub(crate) struct Flow<R, C>
where
    R: Reassembly,
{
    /// Identity reported to callbacks.
    pub(crate) id: FlowId,
    /// Key the flow is stored under.
    pub(crate) key: R::Key,
    /// Timestamp of the first packet.
    pub(crate) created_ts: Instant,
    /// Timestamp of the last observed packet.
    pub(crate) last_seen_ts: Instant,
    /// Number of fragments or segments received.
    pub(crate) nb_pkts: usize,
    /// Expiry timer the flow is armed with.
    pub(crate) timer: TimerId,
    /// When the armed timer fires.
    pub(crate) deadline: Instant,
    /// Protocol-specific reassembly state.
    pub(crate) state: R,
    pub(crate) callback: Callback<R::Key, C>,
    pub(crate) context: C,
}

impl<R, C> Flow<R, C>
where
    R: Reassembly,
{
    pub(crate) fn new(
        id: FlowId,
        key: R::Key,
        state: R,
        callback: Callback<R::Key, C>,
        context: C,
        now: Instant,
    ) -> Self {
        Flow {
            id,
            key,
            created_ts: now,
            last_seen_ts: now,
            nb_pkts: 0,
            timer: 0,
            deadline: now,
            state,
            callback,
            context,
        }
    }

    /// Builds an event for this flow.
    #[inline]
    pub(crate) fn event<'a>(&'a self, reason: Reason, data: &'a [u8]) -> FlowEvent<'a, R::Key, C> {
        FlowEvent::new(self.id, &self.key, &self.context, reason, data)
    }

    /// Invokes the flow's callback.
    #[inline]
    pub(crate) fn dispatch(&self, event: FlowEvent<'_, R::Key, C>) {
        log::debug!(
            "{} {}: {} ({} bytes)",
            self.id,
            self.key,
            event.reason.as_ref(),
            event.data.len()
        );
        (self.callback)(&event);
    }

    /// Hands whatever is buffered to the callback, once per direction. The flow is consumed.
    pub(crate) fn terminate(self, reason: Reason) {
        for (direction, data) in self.state.pending() {
            self.dispatch(self.event(reason, &data).direction(direction));
        }
    }

    /// Terminates the flow with [Reason::Error].
    pub(crate) fn abort(self, error: FlowError) {
        log::warn!("{} {}: {}", self.id, self.key, error);
        for (direction, data) in self.state.pending() {
            self.dispatch(
                self.event(Reason::Error, &data)
                    .direction(direction)
                    .error(error),
            );
        }
    }

    pub(crate) fn info(&self) -> FlowInfo {
        FlowInfo {
            id: self.id,
            created_ts: self.created_ts,
            last_seen_ts: self.last_seen_ts,
            nb_pkts: self.nb_pkts,
            buffered: self.state.buffered(),
            nb_gaps: self.state.nb_gaps(),
            expected_len: self.state.expected_len(),
            complete: self.state.is_complete(),
        }
    }
}

/// Read-only snapshot of a tracked flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowInfo {
    pub id: FlowId,
    #[serde(skip)]
    pub created_ts: Instant,
    #[serde(skip)]
    pub last_seen_ts: Instant,
    /// Fragments or segments received so far.
    pub nb_pkts: usize,
    /// Bytes buffered and not yet delivered.
    pub buffered: usize,
    /// Number of holes in the buffered data.
    pub nb_gaps: usize,
    /// Total length, once known (IP datagrams only).
    pub expected_len: Option<u64>,
    /// `true` once the flow has everything it needs to finish (e.g. a TCP FIN was seen).
    pub complete: bool,
}
