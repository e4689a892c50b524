//! Error types for link operations.
//!
//! Programmer errors (`InvalidArgument`, `InvalidState`) and back-pressure (`NoCredit`) are
//!  returned directly to the caller. Protocol violations by the peer detach the affected link
//!  and are surfaced through [crate::mux::LinkEvent], except for frames that reference no
//!  attached link at all: those are connection-level and returned from
//!  [crate::mux::LinkMux::on_frame].

use thiserror::Error;

/// Well-known error conditions carried in detach frames
pub mod condition {
    /// the peer started more deliveries than it had credit for
    pub const TRANSFER_LIMIT_EXCEEDED: &str = "transfer-limit-exceeded";
    /// a frame that is not legal in the link's or delivery's current state
    pub const ILLEGAL_STATE: &str = "illegal-state";
    /// a frame referencing a handle that is not attached
    pub const UNATTACHED_HANDLE: &str = "unattached-handle";
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum LinkError {
    /// Caller bug: negative credit, buffer range out of bounds, unknown delivery or handle
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller bug: operation on a terminal delivery or on a link that is not attached
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A new delivery cannot be started for lack of credit. The delivery is queued and goes out
    ///  when the peer grants credit.
    #[error("no credit available to start a delivery")]
    NoCredit,

    /// The peer violated the link protocol
    #[error("protocol error: {condition}")]
    ProtocolError { condition: String },

    /// The link was detached by the peer or because of a protocol error
    #[error("link detached (condition: {condition:?})")]
    Detached { condition: Option<String> },
}

impl LinkError {
    pub fn protocol(condition: &str) -> LinkError {
        LinkError::ProtocolError { condition: condition.to_string() }
    }

    /// the condition carried by protocol errors and detaches, if any
    pub fn condition(&self) -> Option<&str> {
        match self {
            LinkError::ProtocolError { condition } => Some(condition),
            LinkError::Detached { condition } => condition.as_deref(),
            _ => None,
        }
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::protocol(LinkError::protocol(condition::TRANSFER_LIMIT_EXCEEDED), Some("transfer-limit-exceeded"))]
    #[case::detached_with(LinkError::Detached { condition: Some("x".to_string()) }, Some("x"))]
    #[case::detached_without(LinkError::Detached { condition: None }, None)]
    #[case::no_credit(LinkError::NoCredit, None)]
    #[case::invalid_state(LinkError::InvalidState("terminal".to_string()), None)]
    fn test_condition(#[case] error: LinkError, #[case] expected: Option<&str>) {
        assert_eq!(error.condition(), expected);
    }
}
