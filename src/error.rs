//! Error types shared across the session core.

use thiserror::Error;

use crate::location::LocationError;
use crate::session::ConnectionState;

/// Why a connect target was rejected before any transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidTarget {
    #[error("target id is empty")]
    Empty,

    #[error("target id is our own id")]
    SelfTarget,
}

/// Errors surfaced by the peer session and its coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Empty or self-referential target; nothing was sent to the transport.
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] InvalidTarget),

    /// A connect was requested while a link already exists or is being set up.
    #[error("cannot connect while {0}")]
    NotIdle(ConnectionState),

    /// The transport could not establish or maintain the channel.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The location capability was denied or cannot produce fixes.
    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    /// The coordinator task has stopped and can no longer take commands.
    #[error("session coordinator is gone")]
    CoordinatorGone,
}

impl From<LocationError> for SessionError {
    fn from(error: LocationError) -> Self {
        SessionError::LocationUnavailable(error.to_string())
    }
}

/// Errors produced while encoding or decoding wire envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("message of type {0:?} carries no data")]
    MissingData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_target_converts() {
        let err: SessionError = InvalidTarget::SelfTarget.into();
        assert_eq!(err, SessionError::InvalidTarget(InvalidTarget::SelfTarget));
        assert_eq!(err.to_string(), "invalid target: target id is our own id");
    }

    #[test]
    fn test_not_idle_mentions_state() {
        let err = SessionError::NotIdle(ConnectionState::Active);
        assert_eq!(err.to_string(), "cannot connect while active");
    }

    #[test]
    fn test_location_failure_converts() {
        let err = SessionError::from(LocationError::Unavailable("no fixes".to_string()));
        assert_eq!(err, SessionError::LocationUnavailable("no fixes".to_string()));
        assert_eq!(err.to_string(), "location unavailable: no fixes");
    }
}
