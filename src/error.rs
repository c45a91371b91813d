//! Error Types
//!
//! Every fallible operation in flashio returns [`Result`], whose error is the
//! single [`Error`] enum below. The variants follow the failure taxonomy of a
//! read or write on a connection:
//!
//! | Variant             | Meaning                                            |
//! |---------------------|----------------------------------------------------|
//! | `BufferUnderflow`   | not enough data queued yet (transient, retry later) |
//! | `MaxSizeExceeded`   | a framing bound was violated (caller should close)  |
//! | `ClosedConnection`  | operation on a connection that was closed locally   |
//! | `EndOfStream`       | peer closed and every queued byte was consumed      |
//! | `Timeout`           | blocking read deadline elapsed                      |
//! | `ConnectTimeout`    | client connect could not complete in time           |
//! | `Io`                | generic transport failure                           |

use crate::buffer::BufferError;
use std::net::SocketAddr;
use std::time::Duration;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by connections, servers and pools.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not enough data is queued to satisfy the read.
    #[error("Buffer underflow: not enough data available")]
    BufferUnderflow,

    /// The delimiter was not found within the allowed number of bytes.
    #[error("Max size exceeded: delimiter not found within {max} bytes")]
    MaxSizeExceeded { max: usize },

    /// A zero-length delimiter was supplied.
    #[error("Delimiter must not be empty")]
    EmptyDelimiter,

    /// The connection has been closed locally.
    #[error("Connection is closed")]
    ClosedConnection,

    /// The peer closed the stream and no more data will arrive.
    #[error("End of stream reached")]
    EndOfStream,

    /// A blocking read did not complete before its deadline.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A client connection could not be established in time.
    #[error("Connect to {address} timed out: {reason}")]
    ConnectTimeout { address: SocketAddr, reason: String },

    /// Pool admission control rejected the request.
    #[error("Max connections exceeded: {0}")]
    MaxConnectionsExceeded(String),

    /// The secure transport engine failed.
    #[error("Secure transport error: {0}")]
    Secure(String),

    /// Text could not be encoded or decoded with the connection's encoding.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The operation is not valid in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// The pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for the transient "not enough data yet" outcome.
    pub fn is_underflow(&self) -> bool {
        matches!(self, Error::BufferUnderflow)
    }

    /// Returns true if the error means the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ClosedConnection | Error::EndOfStream | Error::Secure(_) | Error::Io(_)
        )
    }
}

impl From<BufferError> for Error {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Underflow { .. } => Error::BufferUnderflow,
            BufferError::MaxSizeExceeded { max } => Error::MaxSizeExceeded { max },
            BufferError::EmptyDelimiter => Error::EmptyDelimiter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_error_conversion() {
        let err: Error = BufferError::Underflow {
            requested: 4,
            available: 1,
        }
        .into();
        assert!(err.is_underflow());

        let err: Error = BufferError::MaxSizeExceeded { max: 16 }.into();
        assert!(matches!(err, Error::MaxSizeExceeded { max: 16 }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::ClosedConnection.is_fatal());
        assert!(Error::EndOfStream.is_fatal());
        assert!(!Error::BufferUnderflow.is_fatal());
        assert!(!Error::Timeout(Duration::from_millis(5)).is_fatal());
    }
}
