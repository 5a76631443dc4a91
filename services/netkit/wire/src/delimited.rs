//! Delimiter-based framing for raw bytes and text.
//!
//! A frame is everything up to the first occurrence of a fixed delimiter. By
//! default the delimiter is stripped from the decoded value; encoders built
//! with `including_delimiter(true)` keep it as part of the message.

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoder::{find, Encoder, Extracted};
use crate::error::WireError;

/// Null byte delimiter
pub const NULL_DELIMITER: &[u8] = b"\0";

/// Platform line terminator
#[cfg(windows)]
pub const LINE_ENDING: &[u8] = b"\r\n";
/// Platform line terminator
#[cfg(not(windows))]
pub const LINE_ENDING: &[u8] = b"\n";

/// Raw byte frames separated by a delimiter
#[derive(Debug, Clone)]
pub struct BytesEncoder {
    delimiter: Bytes,
    include_delimiter: bool,
}

impl BytesEncoder {
    /// Create an encoder for a non-empty delimiter
    pub fn new(delimiter: impl Into<Bytes>) -> Result<Self, WireError> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(WireError::EmptyDelimiter);
        }
        Ok(Self {
            delimiter,
            include_delimiter: false,
        })
    }

    /// Frames terminated by a null byte
    pub fn null_terminated() -> Self {
        Self {
            delimiter: Bytes::from_static(NULL_DELIMITER),
            include_delimiter: false,
        }
    }

    /// Frames terminated by the platform line ending
    pub fn lines() -> Self {
        Self {
            delimiter: Bytes::from_static(LINE_ENDING),
            include_delimiter: false,
        }
    }

    /// Keep the delimiter as part of each decoded message
    pub fn including_delimiter(mut self, include: bool) -> Self {
        self.include_delimiter = include;
        self
    }

    /// Delimiter bytes
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Whether decoded messages keep their delimiter
    pub fn includes_delimiter(&self) -> bool {
        self.include_delimiter
    }

    fn encode_slice(&self, payload: &[u8]) -> Bytes {
        if self.include_delimiter && payload.ends_with(&self.delimiter) {
            return Bytes::copy_from_slice(payload);
        }
        let mut buf = BytesMut::with_capacity(payload.len() + self.delimiter.len());
        buf.put_slice(payload);
        buf.put_slice(&self.delimiter);
        buf.freeze()
    }

    fn decode_slice<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        if self.include_delimiter {
            return bytes;
        }
        bytes.strip_suffix(&self.delimiter[..]).unwrap_or(bytes)
    }

    fn extract_slice<'a>(&self, buf: &'a [u8]) -> Option<(&'a [u8], usize)> {
        let position = find(buf, &self.delimiter)?;
        let end = position + self.delimiter.len();
        let content = if self.include_delimiter {
            &buf[..end]
        } else {
            &buf[..position]
        };
        Some((content, end))
    }
}

impl Encoder for BytesEncoder {
    type Item = Bytes;

    fn encode(&self, item: &Bytes) -> Result<Bytes, WireError> {
        Ok(self.encode_slice(item))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes, WireError> {
        Ok(Bytes::copy_from_slice(self.decode_slice(bytes)))
    }

    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extracted<Bytes>>, WireError> {
        Ok(self
            .extract_slice(buf)
            .map(|(content, consumed)| Extracted::new(Bytes::copy_from_slice(content), consumed)))
    }
}

/// UTF-8 text frames separated by a delimiter
#[derive(Debug, Clone)]
pub struct TextEncoder {
    inner: BytesEncoder,
}

impl TextEncoder {
    /// Create an encoder for a non-empty delimiter
    pub fn new(delimiter: impl Into<String>) -> Result<Self, WireError> {
        Ok(Self {
            inner: BytesEncoder::new(Bytes::from(delimiter.into()))?,
        })
    }

    /// Lines terminated by a null byte
    pub fn null_terminated() -> Self {
        Self {
            inner: BytesEncoder::null_terminated(),
        }
    }

    /// Lines terminated by the platform line ending
    pub fn lines() -> Self {
        Self {
            inner: BytesEncoder::lines(),
        }
    }

    /// Keep the delimiter as part of each decoded message
    pub fn including_delimiter(mut self, include: bool) -> Self {
        self.inner = self.inner.including_delimiter(include);
        self
    }

    /// Delimiter bytes
    pub fn delimiter(&self) -> &[u8] {
        self.inner.delimiter()
    }
}

impl Encoder for TextEncoder {
    type Item = String;

    fn encode(&self, item: &String) -> Result<Bytes, WireError> {
        Ok(self.inner.encode_slice(item.as_bytes()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, WireError> {
        Ok(std::str::from_utf8(self.inner.decode_slice(bytes))?.to_string())
    }

    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extracted<String>>, WireError> {
        match self.inner.extract_slice(buf) {
            Some((content, consumed)) => {
                let text = std::str::from_utf8(content)?.to_string();
                Ok(Some(Extracted::new(text, consumed)))
            }
            None => Ok(None),
        }
    }
}
