//! Transport error types.

use netkit_wire::WireError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Failures of a connection or of the sockets behind it
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket operation failed
    #[error("socket error (os code {code:?}): {source}")]
    Socket {
        /// OS error code, when the platform reported one
        code: Option<i32>,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Peer sent bytes the encoder could not frame or decode
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Connection is no longer running
    #[error("connection closed")]
    Closed,

    /// WebSocket upgrade rejected or out of order
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Connect attempt did not finish in time
    #[error("connect to {0} timed out")]
    Timeout(SocketAddr),
}

impl TransportError {
    /// OS error code carried by a socket error
    pub fn os_code(&self) -> Option<i32> {
        match self {
            TransportError::Socket { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(source: io::Error) -> Self {
        TransportError::Socket {
            code: source.raw_os_error(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_error_keeps_os_code() {
        let err: TransportError = io::Error::from_raw_os_error(111).into();
        assert_eq!(err.os_code(), Some(111));
        assert!(err.to_string().contains("111"));

        let err: TransportError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(err.os_code(), None);
    }

    #[test]
    fn test_wire_error_wrapped() {
        let err: TransportError = WireError::Reserved(1).into();
        assert!(matches!(err, TransportError::Protocol(WireError::Reserved(1))));
        assert_eq!(err.os_code(), None);
    }
}
