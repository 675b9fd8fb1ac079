//! Error types for framed exchanges.
//!
//! Failures fall into four classes (see [`FailureKind`]): connect-level
//! failures, transfer failures on an established connection, framing
//! protocol failures, and resource-contract violations. The first three are
//! runtime conditions surfaced to whoever drove the failing phase. The last
//! one means the caller broke an API contract and should be treated as fatal.

use std::io;

use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::runtime::{ConnectionId, ListenerId, Phase};

/// Coarse classification of an [`ExchangeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Refused, unreachable, unresolvable or unbindable endpoint.
    Connect,
    /// Reset, broken pipe, timeout or cancellation mid-exchange.
    Transfer,
    /// The byte stream did not carry a well-formed frame.
    Protocol,
    /// A programming-contract violation.
    Resource,
}

/// Main error type for all exchange operations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("could not resolve '{target}': {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("could not listen on {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("connection {connection} failed while {phase}: {source}")]
    Transfer {
        connection: ConnectionId,
        phase: Phase,
        #[source]
        source: io::Error,
    },

    #[error("connection {connection}: {violation}")]
    Protocol {
        connection: ConnectionId,
        violation: ProtocolViolation,
    },

    #[error("resource contract violated: {0}")]
    Resource(#[from] ResourceViolation),
}

impl ExchangeError {
    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            ExchangeError::Resolve { .. }
            | ExchangeError::Bind { .. }
            | ExchangeError::Connect { .. } => FailureKind::Connect,
            ExchangeError::Transfer { .. } => FailureKind::Transfer,
            ExchangeError::Protocol { .. } => FailureKind::Protocol,
            ExchangeError::Resource(_) => FailureKind::Resource,
        }
    }

    /// True when the failure was caused by a phase deadline expiring.
    pub fn is_timeout(&self) -> bool {
        match self {
            ExchangeError::Connect { source, .. } | ExchangeError::Transfer { source, .. } => {
                source.kind() == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }
}

/// Ways a peer can violate the `<EOF>` framing protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("stream closed before the <EOF> delimiter ({buffered} bytes buffered)")]
    Unterminated { buffered: usize },

    #[error("message exceeds {limit} bytes without a delimiter")]
    Oversized { limit: usize },
}

/// Broken API contracts. These indicate a bug in the caller, not a network
/// condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceViolation {
    #[error("connection handle already released")]
    Released,

    #[error("an accept is already in flight on listener {0}")]
    AcceptInFlight(ListenerId),

    #[error("completion port is shut down")]
    PortClosed,

    #[error("phase signal payload was already consumed")]
    SignalConsumed,

    #[error("connection {0} already delivered its message")]
    FrameConsumed(ConnectionId),

    #[error("phase gate reset while {0} waiter(s) are blocked on it")]
    ResetWhileWaiting(usize),

    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },
}

/// Result type alias using ExchangeError.
pub type Result<T> = std::result::Result<T, ExchangeError>;
