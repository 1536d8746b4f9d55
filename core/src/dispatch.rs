//! Delivery of normalized data to consumers.
//!
//! Every flow is bound to a [Callback]. The engine invokes it synchronously, inside the
//! ingestion or sweep call that triggered it, with a [FlowEvent] describing what happened. The
//! event only lends out read-only views: data that must outlive the callback has to be copied.
//! A callback holds no reference to its session and therefore cannot re-enter it.

use crate::error::FlowError;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;
use strum_macros::AsRefStr;

/// User-defined handler bound to a flow.
pub type Callback<K, C> = Arc<dyn Fn(&FlowEvent<'_, K, C>) + Send + Sync>;

/// Why a callback was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, AsRefStr)]
#[cfg_attr(test, derive(strum_macros::EnumIter))]
pub enum Reason {
    /// A datagram was fully reassembled. The flow is destroyed.
    Complete,
    /// New in-order stream bytes are available.
    Data,
    /// Data overlapped existing bytes and was discarded under the reject policy.
    Overlap,
    /// A per-flow resource limit was exceeded. The flow is destroyed.
    Error,
    /// The flow was evicted to make room for another. The flow is destroyed.
    Evicted,
    /// The flow was idle for too long. The flow is destroyed.
    Timeout,
    /// The connection was reset. The flow is destroyed.
    Reset,
    /// The connection was closed after all of its data was delivered. The flow is destroyed.
    Closed,
}

impl Reason {
    /// Returns a human-readable description of the reason.
    pub fn description(&self) -> &'static str {
        match self {
            Reason::Complete => "Defragmented datagram",
            Reason::Data => "Data",
            Reason::Overlap => "Overlapping data discarded",
            Reason::Error => "Resource limit exceeded",
            Reason::Evicted => "Evicted from full table",
            Reason::Timeout => "Timeout expired",
            Reason::Reset => "Connection reset",
            Reason::Closed => "Connection closed",
        }
    }

    /// Returns `true` if the flow no longer exists once the callback returns.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Reason::Data | Reason::Overlap)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Direction of the delivered bytes relative to the flow's originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// Originator to responder. IP datagrams and unidirectional TCP flows always use this.
    Forward,
    /// Responder to originator.
    Reverse,
}

/// Opaque flow identity, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FlowId(pub(crate) u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// A callback invocation.
#[derive(Debug)]
pub struct FlowEvent<'a, K, C> {
    /// Identity of the flow.
    pub flow: FlowId,
    /// Flow tuple.
    pub key: &'a K,
    /// Delivered bytes. For teardown reasons this is whatever was buffered, with holes
    /// zero-filled. For [Reason::Overlap] it is the discarded data.
    pub data: &'a [u8],
    /// Why the callback was invoked.
    pub reason: Reason,
    /// Direction of `data`.
    pub direction: Direction,
    /// Conflicting stream range, for [Reason::Overlap].
    pub range: Option<Range<u64>>,
    /// Error kind, for [Reason::Error].
    pub error: Option<FlowError>,
    /// User context supplied when the flow was created.
    pub context: &'a C,
}

impl<'a, K, C> FlowEvent<'a, K, C> {
    pub(crate) fn new(
        flow: FlowId,
        key: &'a K,
        context: &'a C,
        reason: Reason,
        data: &'a [u8],
    ) -> Self {
        FlowEvent {
            flow,
            key,
            data,
            reason,
            direction: Direction::Forward,
            range: None,
            error: None,
            context,
        }
    }

    pub(crate) fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub(crate) fn range(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }

    pub(crate) fn error(mut self, error: FlowError) -> Self {
        self.error = Some(error);
        self
    }

    /// Number of delivered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
