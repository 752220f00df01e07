//! Error taxonomy for the bus engine.

use thiserror::Error;

use crate::codec::CodecError;
use crate::message::error_names;
use crate::transport::TransportError;

/// Errors returned by [`Bus`](crate::Bus) and [`Connection`](crate::Connection).
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Remote(#[from] RemoteError),

    #[error("A run phase is already active")]
    AlreadyRunning,

    #[error("An external reactor is already active")]
    AlreadyActive,

    #[error("Connection is closed")]
    Disconnected,

    #[error("Task failed: {0}")]
    TaskFailure(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An error reply received from the remote side, or synthesized locally
/// when a call expires.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True when the call expired before a reply arrived.
    pub fn is_timeout(&self) -> bool {
        self.name == error_names::NO_REPLY
    }
}

impl BusError {
    /// The remote error carried by this error, if any.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            BusError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_no_reply() {
        assert!(RemoteError::new(error_names::NO_REPLY, "expired").is_timeout());
        assert!(!RemoteError::new(error_names::FAILED, "boom").is_timeout());
    }

    #[test]
    fn test_remote_display() {
        let err = BusError::from(RemoteError::new("org.example.Error.Nope", "no"));
        assert_eq!(err.to_string(), "org.example.Error.Nope: no");
        assert!(err.as_remote().is_some());
    }
}
