//! RFC 6455 frame layout.
//!
//! ```text
//!  0               1               2               3
//! |F|R|R|R| opcode|M| payload len |    extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/64)            |
//! |N|V|V|V|       |S|             |                               |
//! |     masking key (0 or 4 bytes)  |          payload ...        |
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Default payload limit (64 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    /// Continuation of a fragmented message
    Continuation = 0x0,
    /// UTF-8 text
    Text = 0x1,
    /// Binary data
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Close, ping and pong
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(WireError::Opcode(other)),
        }
    }
}

/// One WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    /// Final fragment of a message
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Masking key, if the frame is masked
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload
    pub payload: Bytes,
}

impl WsFrame {
    /// Final, unmasked frame
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Text frame
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()))
    }

    /// Binary frame
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    /// Ping frame
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data)
    }

    /// Pong frame
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// Close frame with an optional status code and reason
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let mut payload = BytesMut::new();
        if let Some(code) = code {
            payload.put_u16(code);
            payload.put_slice(reason.as_bytes());
        }
        Self::new(OpCode::Close, payload.freeze())
    }

    /// Set the masking key
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Whether this is a control frame
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Payload as UTF-8 text
    pub fn as_text(&self) -> Result<&str, WireError> {
        Ok(std::str::from_utf8(&self.payload)?)
    }

    /// Status code of a close frame
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Total size when encoded: header, extended length, mask and payload
    pub fn encoded_len(&self) -> usize {
        let len = self.payload.len();
        let extended = match len {
            0..=125 => 0,
            126..=0xFFFF => 2,
            _ => 8,
        };
        let mask = if self.mask.is_some() { 4 } else { 0 };
        2 + extended + mask + len
    }

    /// Encode using the minimal length form, masking the payload if a key is set
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        buf.put_u8(b0);

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();
        match len {
            0..=125 => buf.put_u8(mask_bit | len as u8),
            126..=0xFFFF => {
                buf.put_u8(mask_bit | 126);
                buf.put_u16(len as u16);
            }
            _ => {
                buf.put_u8(mask_bit | 127);
                buf.put_u64(len as u64);
            }
        }

        match self.mask {
            Some(key) => {
                buf.put_slice(&key);
                let start = buf.len();
                buf.put_slice(&self.payload);
                apply_mask(&mut buf[start..], key);
            }
            None => buf.put_slice(&self.payload),
        }

        buf.freeze()
    }
}

/// XOR `data` with the masking key; applying it twice restores the input
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Parse one frame from the front of `buf`.
///
/// Returns the frame with its payload unmasked and the number of bytes it
/// occupied, or `None` if the frame is not complete yet.
pub fn parse(buf: &[u8], max_payload: usize) -> Result<Option<(WsFrame, usize)>, WireError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let rsv = (b0 >> 4) & 0x07;
    if rsv != 0 {
        return Err(WireError::Reserved(rsv));
    }
    let fin = b0 & 0x80 != 0;
    let opcode = OpCode::try_from(b0 & 0x0F)?;

    let b1 = buf[1];
    let masked = b1 & 0x80 != 0;
    let (len, mut offset) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(WireError::Size(len));
            }
            (len, 10)
        }
        short => (short as u64, 2),
    };

    if len > max_payload as u64 {
        return Err(WireError::Size(len));
    }
    if opcode.is_control() {
        if !fin {
            return Err(WireError::Control("fragmented control frame"));
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(WireError::Control("control payload over 125 bytes"));
        }
    }

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let len = len as usize;
    if buf.len() < offset + len {
        return Ok(None);
    }

    let mut payload = BytesMut::from(&buf[offset..offset + len]);
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }
    let consumed = offset + len;

    let frame = WsFrame {
        fin,
        opcode,
        mask,
        payload: payload.freeze(),
    };

    let encoded = frame.encoded_len();
    if encoded != consumed {
        return Err(WireError::SizeMismatch { encoded, consumed });
    }

    Ok(Some((frame, consumed)))
}
