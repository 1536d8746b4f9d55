//! Per-session counters.

use serde::Serialize;

/// Counters maintained by every session.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Fragments or segments accepted for processing.
    pub packets: u64,
    /// Segments ignored because they could not start or continue a flow.
    pub ignored: u64,
    /// Fragments or segments rejected with a call-level error.
    pub malformed: u64,
    pub flows_created: u64,
    /// New flows refused because the table was full.
    pub flows_rejected: u64,
    pub flows_completed: u64,
    pub flows_closed: u64,
    pub flows_reset: u64,
    pub flows_evicted: u64,
    pub flows_timed_out: u64,
    /// Flows destroyed for exceeding a resource limit.
    pub flows_aborted: u64,
    /// Fragments or segments refused because the session memory budget was exhausted.
    pub over_budget: u64,
    /// Overlapping data discarded under the reject policy.
    pub overlaps: u64,
    /// Bytes handed to callbacks as in-order or complete data.
    pub bytes_delivered: u64,
}
