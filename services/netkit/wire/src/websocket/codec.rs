//! WebSocket stream encoder.
//!
//! Before the upgrade completes the stream carries HTTP text, afterwards binary
//! frames. A leading `G` or `H` byte would set a reserved bit in a frame header,
//! so it always marks handshake text (`GET ...` / `HTTP/...`).

use bytes::Bytes;
use tracing::trace;

use super::frame::{self, WsFrame, DEFAULT_MAX_PAYLOAD};
use super::handshake::HEADER_TERMINATOR;
use crate::encoder::{find, Encoder, Extracted};
use crate::error::WireError;

/// Unit carried by a WebSocket stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsPacket {
    /// Raw HTTP upgrade request or response, including the blank line
    Handshake(String),
    /// Binary frame
    Frame(WsFrame),
}

impl WsPacket {
    /// Frame, if this is not handshake text
    pub fn as_frame(&self) -> Option<&WsFrame> {
        match self {
            WsPacket::Frame(frame) => Some(frame),
            WsPacket::Handshake(_) => None,
        }
    }
}

impl From<WsFrame> for WsPacket {
    fn from(frame: WsFrame) -> Self {
        WsPacket::Frame(frame)
    }
}

/// Side of the connection an encoder writes for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Writes unmasked frames
    Server,
    /// Masks every frame it writes
    Client,
}

/// Encoder for handshake text and RFC 6455 frames
#[derive(Debug, Clone)]
pub struct WsEncoder {
    role: Role,
    max_payload: usize,
}

impl WsEncoder {
    /// Create an encoder for `role`
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Server-side encoder
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Client-side encoder
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Set the largest accepted payload
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Encoder role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Largest accepted payload
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn outgoing(&self, frame: &WsFrame) -> WsFrame {
        let mut frame = frame.clone();
        match self.role {
            Role::Server => frame.mask = None,
            Role::Client => {
                if frame.mask.is_none() {
                    frame.mask = Some(rand::random());
                }
            }
        }
        frame
    }
}

fn is_handshake_start(byte: u8) -> bool {
    byte == b'G' || byte == b'H'
}

impl Encoder for WsEncoder {
    type Item = WsPacket;

    fn encode(&self, item: &WsPacket) -> Result<Bytes, WireError> {
        match item {
            WsPacket::Handshake(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            WsPacket::Frame(frame) => {
                if frame.payload.len() > self.max_payload {
                    return Err(WireError::Size(frame.payload.len() as u64));
                }
                Ok(self.outgoing(frame).encode())
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<WsPacket, WireError> {
        self.try_extract(bytes)?
            .map(|extracted| extracted.value)
            .ok_or(WireError::Malformed("incomplete websocket packet"))
    }

    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extracted<WsPacket>>, WireError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        if is_handshake_start(first) {
            return match find(buf, HEADER_TERMINATOR) {
                Some(position) => {
                    let end = position + HEADER_TERMINATOR.len();
                    let text = std::str::from_utf8(&buf[..end])?.to_string();
                    trace!(bytes = end, "extracted handshake text");
                    Ok(Some(Extracted::new(WsPacket::Handshake(text), end)))
                }
                None => Ok(None),
            };
        }

        Ok(frame::parse(buf, self.max_payload)?
            .map(|(frame, consumed)| Extracted::new(WsPacket::Frame(frame), consumed)))
    }

    fn echo(&self, item: &WsPacket) -> Option<WsPacket> {
        match item {
            WsPacket::Frame(frame) if !frame.is_control() => {
                let mut frame = frame.clone();
                frame.mask = None;
                Some(WsPacket::Frame(frame))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::handshake;

    #[test]
    fn test_handshake_then_frames() {
        let encoder = WsEncoder::server();
        let request = handshake::client_request("localhost", "/", "dGhlIHNhbXBsZSBub25jZQ==");
        let mut stream = request.clone().into_bytes();
        stream.extend_from_slice(&WsFrame::text("hi").with_mask([1, 2, 3, 4]).encode());

        let first = encoder.try_extract(&stream).unwrap().unwrap();
        assert_eq!(first.value, WsPacket::Handshake(request.clone()));
        assert_eq!(first.consumed, request.len());

        let second = encoder.try_extract(&stream[first.consumed..]).unwrap().unwrap();
        let frame = second.value.as_frame().unwrap();
        assert_eq!(frame.as_text().unwrap(), "hi");
        assert_eq!(first.consumed + second.consumed, stream.len());
    }

    #[test]
    fn test_incomplete_handshake_waits() {
        let encoder = WsEncoder::server();
        assert!(encoder.try_extract(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
        assert!(encoder.try_extract(b"").unwrap().is_none());
    }

    #[test]
    fn test_server_never_masks() {
        let encoder = WsEncoder::server();
        let packet = WsPacket::Frame(WsFrame::text("hi").with_mask([1, 2, 3, 4]));
        assert_eq!(&encoder.encode(&packet).unwrap()[..], &[0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_client_always_masks() {
        let client = WsEncoder::client();
        let encoded = client.encode(&WsFrame::text("hello").into()).unwrap();
        assert_eq!(encoded[1] & 0x80, 0x80);
        assert_eq!(encoded.len(), 2 + 4 + 5);

        let server = WsEncoder::server();
        let decoded = server.decode(&encoded).unwrap();
        assert_eq!(decoded.as_frame().unwrap().as_text().unwrap(), "hello");
    }

    #[test]
    fn test_echo_skips_control_and_handshake() {
        let encoder = WsEncoder::server();
        assert!(encoder.echo(&WsPacket::Handshake("GET /".into())).is_none());
        assert!(encoder.echo(&WsFrame::ping("p").into()).is_none());

        let echoed = encoder
            .echo(&WsFrame::text("x").with_mask([5, 6, 7, 8]).into())
            .unwrap();
        assert_eq!(echoed.as_frame().unwrap().mask, None);
    }

    #[test]
    fn test_payload_limit() {
        let encoder = WsEncoder::server().with_max_payload(4);
        assert!(matches!(
            encoder.encode(&WsFrame::binary(vec![0u8; 5]).into()),
            Err(WireError::Size(5))
        ));
        let encoded = WsFrame::binary(vec![0u8; 5]).encode();
        assert!(matches!(encoder.try_extract(&encoded), Err(WireError::Size(5))));
    }
}
