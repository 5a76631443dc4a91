//! Wire encoders for netkit: turning typed values into bytes and finding frame
//! boundaries in a growing receive buffer.
//!
//! ## Encoders
//!
//! - **BytesEncoder / TextEncoder**: frames separated by a configurable delimiter
//! - **JsonEncoder**: brace-balanced JSON objects, decoded with `serde`
//! - **XmlEncoder**: the shortest prefix that is a well-formed XML document
//! - **WsEncoder**: WebSocket handshake text followed by RFC 6455 frames
//!
//! ## WebSocket Frame
//!
//! ```text
//! +-----+------+--------+------+-------------+-----------+---------+
//! | FIN | RSV  | opcode | MASK | len (7 bit) | ext len   | mask    |
//! | 1b  | 3b   | 4b     | 1b   | 126/127 ->  | 16/64 bit | 0/4 B   |
//! +-----+------+--------+------+-------------+-----------+---------+
//! | payload (masked with the key when MASK is set)                 |
//! +----------------------------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delimited;
pub mod encoder;
pub mod error;
pub mod json;
pub mod websocket;
pub mod xml;

// Re-export main types
pub use delimited::{BytesEncoder, TextEncoder, LINE_ENDING, NULL_DELIMITER};
pub use encoder::{Encoder, Extracted};
pub use error::WireError;
pub use json::JsonEncoder;
pub use websocket::{OpCode, Role, WsEncoder, WsFrame, WsPacket, DEFAULT_MAX_PAYLOAD};
pub use xml::XmlEncoder;
