//! Brace-balanced JSON framing.
//!
//! A frame starts at the first `{` (leading whitespace is skipped and counted
//! as consumed) and ends where the brace depth returns to zero. Braces inside
//! string literals do not count.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

use crate::encoder::{Encoder, Extracted};
use crate::error::WireError;

/// JSON object frames decoded into `T`
pub struct JsonEncoder<T = serde_json::Value> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonEncoder<T> {
    /// Create an encoder
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonEncoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonEncoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonEncoder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonEncoder")
    }
}

/// Length of the first balanced `{...}` object in `buf`, including leading whitespace
fn balanced_object_len(buf: &[u8]) -> Result<Option<(usize, usize)>, WireError> {
    let Some(start) = buf.iter().position(|b| !b.is_ascii_whitespace()) else {
        return Ok(None);
    };
    if buf[start] != b'{' {
        return Err(WireError::Malformed("json frame must start with '{'"));
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in buf[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some((start, start + offset + 1)));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

impl<T> Encoder for JsonEncoder<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    type Item = T;

    fn encode(&self, item: &T) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(item)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extracted<T>>, WireError> {
        match balanced_object_len(buf)? {
            Some((start, end)) => {
                let value = serde_json::from_slice(&buf[start..end])?;
                Ok(Some(Extracted::new(value, end)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        note: String,
    }

    #[test]
    fn test_nested_object_frame() {
        let encoder: JsonEncoder = JsonEncoder::new();
        let buf = br#"{"a":{"b":1}}{"next":true}"#;
        let extracted = encoder.try_extract(buf).unwrap().unwrap();
        assert_eq!(extracted.value, json!({"a": {"b": 1}}));
        assert_eq!(extracted.consumed, 13);
        assert_eq!(&buf[extracted.consumed..], br#"{"next":true}"#);
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let encoder = JsonEncoder::<Order>::new();
        let order = Order {
            id: 7,
            note: "curly } \" { braces".to_string(),
        };
        let encoded = encoder.encode(&order).unwrap();
        let extracted = encoder.try_extract(&encoded).unwrap().unwrap();
        assert_eq!(extracted.value, order);
        assert_eq!(extracted.consumed, encoded.len());
    }

    #[test]
    fn test_partial_object() {
        let encoder: JsonEncoder = JsonEncoder::new();
        assert!(encoder.try_extract(br#"{"a":{"b":"#).unwrap().is_none());
        assert!(encoder.try_extract(b"   ").unwrap().is_none());
    }

    #[test]
    fn test_leading_whitespace_consumed() {
        let encoder: JsonEncoder = JsonEncoder::new();
        let extracted = encoder.try_extract(b"\n  {\"x\":1}").unwrap().unwrap();
        assert_eq!(extracted.consumed, 10);
        assert_eq!(extracted.value, json!({"x": 1}));
    }

    #[test]
    fn test_garbage_rejected() {
        let encoder: JsonEncoder = JsonEncoder::new();
        assert!(matches!(
            encoder.try_extract(b"[1,2]"),
            Err(WireError::Malformed(_))
        ));
    }
}
