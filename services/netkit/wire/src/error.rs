//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Reserved bits nonzero
    #[error("reserved bits nonzero: {0:#05b}")]
    Reserved(u8),

    /// Unknown WebSocket opcode
    #[error("unknown opcode {0:#x}")]
    Opcode(u8),

    /// Payload larger than the configured limit
    #[error("size limit exceeded: {0}")]
    Size(u64),

    /// Encoded frame size differs from the bytes consumed
    #[error("frame size mismatch: encoded {encoded}, consumed {consumed}")]
    SizeMismatch {
        /// Size the frame occupies when re-encoded
        encoded: usize,
        /// Bytes consumed from the stream
        consumed: usize,
    },

    /// Control frame fragmented or with an oversized payload
    #[error("invalid control frame: {0}")]
    Control(&'static str),

    /// Delimiter must not be empty
    #[error("empty delimiter")]
    EmptyDelimiter,

    /// Payload is not valid UTF-8
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// JSON encode/decode failure
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Document is not well-formed XML
    #[error("xml not well-formed: {0}")]
    Xml(String),

    /// Not a valid WebSocket handshake
    #[error("not a valid handshake: {0}")]
    Handshake(String),

    /// Malformed frame structure
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

impl From<std::string::FromUtf8Error> for WireError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        WireError::Utf8(err.utf8_error())
    }
}
