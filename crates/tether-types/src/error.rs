//! Shared error types for the Tether system.

use crate::codec::CodecError;
use crate::identity::PeerAddress;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while constructing or parsing core values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    /// A service id parsed from input was zero or negative.
    #[error("Service id must be positive: {0}")]
    NonPositiveServiceId(i64),

    /// Text could not be parsed into the requested value.
    #[error("Invalid {kind}: {value}")]
    Parse {
        /// What was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },

    /// A description title used the reserved brand keyword.
    #[error("\"{0}\" is a reserved keyword")]
    ReservedKeyword(&'static str),

    /// Key material had the wrong shape.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Failure category of a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The remote or local handler raised an application error.
    Execution,
    /// The operation was cancelled while waiting.
    Interrupted,
    /// No route to the target peer.
    Unregistered,
    /// Transport-level failure.
    Io,
    /// No response within the caller's deadline.
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution => write!(f, "execution"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Unregistered => write!(f, "unregistered"),
            Self::Io => write!(f, "io"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// The single failure type surfaced by session requests and submissions.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A handler raised an application error.
    #[error("Remote exception: {0}")]
    Execution(String),

    /// The operation was cancelled while waiting.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// The target peer has no known route.
    #[error("No route to peer {0}")]
    Unregistered(PeerAddress),

    /// A transport-level failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No response arrived before the deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl ServiceError {
    /// Category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Execution(_) => ErrorKind::Execution,
            Self::Interrupted(_) => ErrorKind::Interrupted,
            Self::Unregistered(_) => ErrorKind::Unregistered,
            Self::Io(_) => ErrorKind::Io,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Shorthand for an I/O failure with a message.
    pub fn io(kind: std::io::ErrorKind, msg: impl Into<String>) -> Self {
        Self::Io(std::io::Error::new(kind, msg.into()))
    }
}

impl From<CodecError> for ServiceError {
    fn from(e: CodecError) -> Self {
        Self::Io(e.into())
    }
}

/// Alias for Result with ServiceError.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            ServiceError::Execution("boom".into()).kind(),
            ErrorKind::Execution
        );
        assert_eq!(
            ServiceError::Timeout(Duration::from_secs(5)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            ServiceError::Unregistered(PeerAddress::NULL).kind(),
            ErrorKind::Unregistered
        );
        assert_eq!(
            ServiceError::io(std::io::ErrorKind::NotConnected, "Not connected").kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_codec_error_is_io() {
        let err: ServiceError = CodecError::EndOfBuffer.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
