//! Error types for broker clients
//!
//! Every asynchronous operation completes with a [`BrokerResult`]. Failures are
//! expected and frequent (children exit, brokers go away), so they are plain values
//! carrying an [`ErrorKind`] that callers match on rather than parse.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type used by every broker operation
pub type BrokerResult<T> = Result<T, MultiClientError>;

/// Category of a broker failure
///
/// The same enum travels on the wire inside `LaunchError` and `WaitError` frames,
/// so variants must only ever be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The socket died or was never attached
    ConnectionLost,
    /// The child id is unknown to the broker or to this handle
    NoSuchChild,
    /// The child has not terminated yet
    CannotWait,
    /// Unclassified broker-side failure
    Unknown,
    /// The broker could not spawn the child (or the broker itself could not be spawned)
    ForkFailed,
    /// A wait raced with a preemptive wait still in flight for the same child
    PreemptiveWaitResponse,
    /// Read or write failure on the socket
    Io,
    /// A frame could not be decoded
    ProtocolError,
    /// Nothing is listening on the broker socket
    CannotConnect,
    /// The terminal status of this child was already consumed
    AlreadyWaited,
    /// The broker did not answer within the configured request timeout
    TimedOut,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::NoSuchChild => "no such child",
            ErrorKind::CannotWait => "cannot wait",
            ErrorKind::Unknown => "unknown error",
            ErrorKind::ForkFailed => "fork failed",
            ErrorKind::PreemptiveWaitResponse => "preemptive wait response",
            ErrorKind::Io => "i/o error",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::CannotConnect => "cannot connect",
            ErrorKind::AlreadyWaited => "already waited",
            ErrorKind::TimedOut => "timed out",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed broker operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct MultiClientError {
    kind: ErrorKind,
    message: String,
}

impl MultiClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionLost, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, message)
    }

    /// Classify a socket error
    ///
    /// EOF means the broker hung up; `InvalidData` comes out of the frame decoder.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => {
                Self::connection_lost(format!("broker connection closed: {}", err))
            }
            io::ErrorKind::InvalidData => Self::protocol(err.to_string()),
            _ => Self::new(ErrorKind::Io, err.to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = MultiClientError::new(ErrorKind::NoSuchChild, "child 7");
        assert_eq!(err.to_string(), "no such child: child 7");
    }

    #[test]
    fn test_from_io_classification() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(MultiClientError::from_io(&eof).kind(), ErrorKind::ConnectionLost);

        let garbage = io::Error::new(io::ErrorKind::InvalidData, "bad frame");
        assert_eq!(MultiClientError::from_io(&garbage).kind(), ErrorKind::ProtocolError);

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(MultiClientError::from_io(&other).kind(), ErrorKind::Io);
    }
}
