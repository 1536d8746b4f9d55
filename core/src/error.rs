//! Error catalog.
//!
//! Every fallible engine operation returns a [FlowError]. Call-level errors never poison a
//! session: after any error the session is left exactly as usable as before the call.
//! Protocol-level anomalies (overlap, reset, timeout, eviction) are not errors; they are
//! reported through the flow callback with a [Reason](crate::Reason).

use serde::Serialize;
use thiserror::Error;

/// Typed failure kinds shared by all engine components.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(test, derive(strum_macros::EnumIter))]
pub enum FlowError {
    /// Malformed call, e.g. a non-positive table capacity.
    #[error("Invalid argument")]
    InvalidArgument,

    /// A reassembly buffer could not be grown.
    #[error("Cannot allocate memory")]
    OutOfMemory,

    /// The flow table is at capacity and configured to reject new flows.
    #[error("No space left for new flows")]
    SessionFull,

    /// A flow with the same key is already tracked.
    #[error("Flow key already exists")]
    DuplicateKey,

    /// Offset or length inconsistent with the configured limits or with earlier fragments.
    #[error("Malformed header")]
    MalformedHeader,

    /// A per-flow size or fragment count bound was exceeded.
    #[error("Resource limit exceeded")]
    ResourceLimitExceeded,
}

impl FlowError {
    /// Returns a human-readable description of the error kind.
    pub fn description(&self) -> &'static str {
        match self {
            FlowError::InvalidArgument => "Invalid argument",
            FlowError::OutOfMemory => "Cannot allocate memory",
            FlowError::SessionFull => "No space left for new flows",
            FlowError::DuplicateKey => "Flow key already exists",
            FlowError::MalformedHeader => "Malformed header",
            FlowError::ResourceLimitExceeded => "Resource limit exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn core_error_description_matches_display() {
        for err in FlowError::iter() {
            assert_eq!(err.to_string(), err.description());
        }
    }

    #[test]
    fn core_error_descriptions_unique() {
        let mut descs: Vec<_> = FlowError::iter().map(|e| e.description()).collect();
        descs.sort_unstable();
        descs.dedup();
        assert_eq!(descs.len(), FlowError::iter().count());
    }
}
