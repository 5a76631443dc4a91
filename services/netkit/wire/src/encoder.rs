//! Encoder contract shared by every framing strategy.
//!
//! An encoder turns values into bytes and back, and finds frame boundaries in a
//! growing receive buffer. Extraction only looks at the buffer; the caller
//! removes the consumed prefix, so a partial frame simply yields `None` and is
//! retried once more bytes arrive.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::WireError;

/// One value found at the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted<T> {
    /// Decoded value
    pub value: T,
    /// Bytes the value occupied, including delimiters and headers
    pub consumed: usize,
}

impl<T> Extracted<T> {
    /// Pair a value with the bytes it occupied
    pub fn new(value: T, consumed: usize) -> Self {
        Self { value, consumed }
    }
}

/// Strategy converting between typed values and wire bytes
pub trait Encoder: Send + Sync + 'static {
    /// Value type carried by one frame
    type Item: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// Serialize one value into a complete frame
    fn encode(&self, item: &Self::Item) -> Result<Bytes, WireError>;

    /// Parse one complete frame
    fn decode(&self, bytes: &[u8]) -> Result<Self::Item, WireError>;

    /// Find the first complete frame at the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete. Never consumes more
    /// than one value and does not depend on previous calls.
    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extracted<Self::Item>>, WireError>;

    /// Value to send back when echoing `item`, or `None` to skip it
    fn echo(&self, item: &Self::Item) -> Option<Self::Item> {
        Some(item.clone())
    }

    /// Extract one frame and remove exactly its bytes from `buf`
    fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Extracted<Self::Item>>, WireError> {
        match self.try_extract(&buf[..])? {
            Some(extracted) => {
                buf.advance(extracted.consumed);
                Ok(Some(extracted))
            }
            None => Ok(None),
        }
    }
}

/// Find the first occurrence of `needle` in `haystack`
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
