use thiserror::Error;

use crate::keys::KeyError;
use crate::protocol::{ProtocolError, Status};
use crate::transcode::TranscodeError;

/// An error observed while talking to the cluster. Server status codes are
/// not represented here unless an operation's contract makes them fatal;
/// normal statuses travel on [`crate::client::CacheResult`] instead.
#[derive(Debug, Error)]
pub enum Error {
    /// An error communicating over the wire.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer sent bytes that do not parse as the protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// A value failed to convert to or from its stored payload.
    #[error("transcode error: {0}")]
    Transcode(#[from] TranscodeError),
    /// A non-zero status where the operation needed success to continue.
    #[error("server returned: {0}")]
    Status(Status),
    /// The application key did not survive transformation and validation.
    #[error("invalid key: {0}")]
    Key(#[from] KeyError),
    /// The locator found no live node for the key.
    #[error("no available node")]
    NoAvailableNode,
    /// Socket acquisition timed out with the pool at capacity.
    #[error("socket pool exhausted")]
    PoolExhausted,
    /// TCP connect did not finish within the configured timeout.
    #[error("connect timed out")]
    ConnectTimeout,
    /// A response did not arrive within the configured timeout.
    #[error("receive timed out")]
    ReadTimeout,
    /// The SASL handshake failed on a fresh socket.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Expirations must be at least one second and fit the wire format.
    #[error("invalid expiration")]
    InvalidExpiration,
}

impl Error {
    /// Whether this error implicates the node itself rather than the
    /// caller or local resource limits. Node faults mark the node dead.
    pub(crate) fn is_node_fault(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::ConnectTimeout | Error::ReadTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            "protocol error: invalid magic byte: 0x08",
            Error::Protocol(ProtocolError::InvalidMagic(8)).to_string()
        );
        assert_eq!(
            "server returned: key not found",
            Error::Status(Status::KeyNotFound).to_string()
        );
    }

    #[test]
    fn fault_classification() {
        assert!(Error::ConnectTimeout.is_node_fault());
        assert!(Error::Protocol(ProtocolError::UnexpectedEof).is_node_fault());
        assert!(!Error::PoolExhausted.is_node_fault());
        assert!(!Error::NoAvailableNode.is_node_fault());
        assert!(!Error::Auth("denied".into()).is_node_fault());
    }
}
