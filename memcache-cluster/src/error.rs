use std::io;

use crate::codec::Status;

/// Errors surfaced by the codec, transports, nodes and locators.
///
/// Only some of them are fatal to a connection; see [`Error::is_fatal`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad magic byte or an impossible header; the stream cannot be resynchronised.
    #[error("framing error: {0}")]
    Framing(String),

    /// A response whose shape does not match the request it answers.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The response opaque does not belong to the oldest pending request.
    #[error("response opaque {actual:#010x} does not match pending request {expected:?}")]
    Correlation { expected: Option<u32>, actual: u32 },

    #[error("authentication failed with status {0:?}")]
    Authentication(Status),

    /// Backpressure: the transport has no free pending slot.
    #[error("pending request queue is full")]
    QueueFull,

    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    ConnectionClosed,

    /// No transport of the node became available before the deadline.
    #[error("timed out waiting for an available transport")]
    Timeout,

    #[error("shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error tears down the connection it happened on.
    ///
    /// Backpressure, argument and availability errors leave the transport
    /// untouched; the caller should move on to another transport or node.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Framing(_)
                | Error::Protocol(_)
                | Error::Correlation { .. }
                | Error::Authentication(_)
                | Error::ConnectionClosed
                | Error::Io(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_is_not_fatal() {
        assert!(!Error::QueueFull.is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::Argument("key".into()).is_fatal());
        assert!(Error::Correlation { expected: Some(1), actual: 2 }.is_fatal());
        assert!(Error::Framing("magic".into()).is_fatal());
    }

    #[test]
    fn correlation_message_mentions_both_sides() {
        let err = Error::Correlation { expected: Some(7), actual: 9 };
        let text = err.to_string();
        assert!(text.contains("0x00000009"), "{text}");
        assert!(text.contains("Some(7)"), "{text}");
    }
}
