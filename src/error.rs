//! Error types
//!
//! `Error` follows the event system's failure taxonomy. `WireError` covers the
//! marshaling layer and is wrapped as `Error::DataIntegrity` when it surfaces
//! from a received frame set.

use crate::wire::value::{DevError, ErrSeverity};

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Event system error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Publisher admin interface unreachable
    #[error("connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    /// Transport send/receive failure
    #[error("communication failed: {0}")]
    CommunicationFailed(String),

    /// Endpoint setup failure (no free port, bad endpoint, already started)
    #[error("event system failed: {0}")]
    EventSystemFailed(String),

    /// Subscription refused by the publisher or rejected locally
    #[error("{reason}: {desc}")]
    PreconditionViolation { reason: String, desc: String },

    /// Malformed incoming frame set
    #[error("data integrity: {0}")]
    DataIntegrity(#[from] WireError),

    /// Subscription id is not known to the consumer
    #[error("unknown subscription id {0}")]
    UnknownSubscription(u64),

    /// Queue operation on a callback subscription
    #[error("subscription {0} does not use an event queue")]
    NotQueueSink(u64),

    /// I/O error from a socket transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn connection(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn precondition(reason: impl Into<String>, desc: impl Into<String>) -> Self {
        Error::PreconditionViolation {
            reason: reason.into(),
            desc: desc.into(),
        }
    }

    /// Reason code carried when this error travels inside an error event
    pub fn reason(&self) -> &str {
        match self {
            Error::ConnectionFailed { .. } => "API_ConnectionFailed",
            Error::CommunicationFailed(_) => "API_CommunicationFailed",
            Error::EventSystemFailed(_) => "API_EventSystemFailed",
            Error::PreconditionViolation { reason, .. } => reason,
            Error::DataIntegrity(_) => "API_DataIntegrity",
            Error::UnknownSubscription(_) => "API_EventNotFound",
            Error::NotQueueSink(_) => "API_NotQueueSink",
            Error::Io(_) => "API_CommunicationFailed",
        }
    }

    /// Convert to an error list suitable for an error event payload
    pub fn to_dev_errors(&self, origin: &str) -> Vec<DevError> {
        vec![DevError {
            reason: self.reason().to_string(),
            desc: self.to_string(),
            origin: origin.to_string(),
            severity: ErrSeverity::Err,
        }]
    }
}

/// Marshaling error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Buffer ended before the value did
    #[error("unexpected end of buffer")]
    UnexpectedEof,
    /// String bytes were not UTF-8
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    /// Unknown union discriminant or enum code
    #[error("unknown tag {0}")]
    UnknownTag(u32),
    /// Message did not have the expected number of frames
    #[error("expected {expected} frames, got {actual}")]
    FrameCount { expected: usize, actual: usize },
    /// Call header carried a method we do not handle
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    /// Endianness frame was not 0 or 1
    #[error("invalid endianness byte {0}")]
    BadEndian(u8),
    /// Event name could not be split into its parts
    #[error("invalid event name {0:?}")]
    InvalidEventName(String),
    /// Frame or message exceeded the size limit
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
    /// Bytes left over after a complete payload
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}
