//! WebSocket support: RFC 6455 frames, the opening handshake and a stream
//! encoder that carries both.

pub mod codec;
pub mod frame;
pub mod handshake;

pub use codec::{Role, WsEncoder, WsPacket};
pub use frame::{apply_mask, OpCode, WsFrame, DEFAULT_MAX_PAYLOAD, MAX_CONTROL_PAYLOAD};
