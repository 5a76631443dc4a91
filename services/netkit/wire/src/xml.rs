//! Well-formed XML document framing.
//!
//! Every `>` in the buffer is a candidate frame end. The first prefix that
//! parses as a complete document (one root element, balanced tags, no text
//! outside the root) is the frame.

use bytes::Bytes;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::encoder::{Encoder, Extracted};
use crate::error::WireError;

/// XML documents carried as text
#[derive(Debug, Clone, Default)]
pub struct XmlEncoder;

impl XmlEncoder {
    /// Create an encoder
    pub fn new() -> Self {
        Self
    }
}

/// Check that `doc` is one complete, well-formed XML document
pub fn check_well_formed(doc: &[u8]) -> Result<(), WireError> {
    let mut reader = Reader::from_reader(doc);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut root_closed = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| WireError::Xml(e.to_string()))?;
        match event {
            Event::Eof => break,
            Event::Start(_) => {
                if depth == 0 && root_closed {
                    return Err(WireError::Xml("more than one root element".to_string()));
                }
                depth += 1;
            }
            Event::End(_) => {
                if depth == 0 {
                    return Err(WireError::Xml("unexpected closing tag".to_string()));
                }
                depth -= 1;
                if depth == 0 {
                    root_closed = true;
                }
            }
            Event::Empty(_) => {
                if depth == 0 {
                    if root_closed {
                        return Err(WireError::Xml("more than one root element".to_string()));
                    }
                    root_closed = true;
                }
            }
            Event::Text(text) => {
                if depth == 0 && !text.iter().all(u8::is_ascii_whitespace) {
                    return Err(WireError::Xml("text outside the root element".to_string()));
                }
            }
            Event::CData(_) if depth == 0 => {
                return Err(WireError::Xml("cdata outside the root element".to_string()));
            }
            _ => {}
        }
        buf.clear();
    }

    if depth == 0 && root_closed {
        Ok(())
    } else {
        Err(WireError::Xml("document is incomplete".to_string()))
    }
}

impl Encoder for XmlEncoder {
    type Item = String;

    fn encode(&self, item: &String) -> Result<Bytes, WireError> {
        Ok(Bytes::copy_from_slice(item.as_bytes()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, WireError> {
        check_well_formed(bytes)?;
        Ok(std::str::from_utf8(bytes)?.trim_start().to_string())
    }

    fn try_extract(&self, buf: &[u8]) -> Result<Option<Extracted<String>>, WireError> {
        let Some(start) = buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            return Ok(None);
        };
        if buf[start] != b'<' {
            return Err(WireError::Xml("document must start with '<'".to_string()));
        }

        for (end, _) in buf.iter().enumerate().skip(start).filter(|(_, &b)| b == b'>') {
            let candidate = &buf[start..=end];
            if check_well_formed(candidate).is_ok() {
                let text = std::str::from_utf8(candidate)?.to_string();
                return Ok(Some(Extracted::new(text, end + 1)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_complete_document() {
        let encoder = XmlEncoder::new();
        let buf = b"<?xml version=\"1.0\"?><a><b x=\"1>2\">t</b></a><c/>";
        let extracted = encoder.try_extract(buf).unwrap().unwrap();
        assert_eq!(
            extracted.value,
            "<?xml version=\"1.0\"?><a><b x=\"1>2\">t</b></a>"
        );
        assert_eq!(&buf[extracted.consumed..], b"<c/>");
    }

    #[test]
    fn test_partial_document() {
        let encoder = XmlEncoder::new();
        assert!(encoder.try_extract(b"<a><b>").unwrap().is_none());
        assert!(encoder.try_extract(b"<a><b></b>").unwrap().is_none());
        assert!(encoder.try_extract(b"<a attr=\"x").unwrap().is_none());
    }

    #[test]
    fn test_self_closing_root() {
        let encoder = XmlEncoder::new();
        let extracted = encoder.try_extract(b"  <ping/>rest").unwrap().unwrap();
        assert_eq!(extracted.value, "<ping/>");
        assert_eq!(extracted.consumed, 9);
    }

    #[test]
    fn test_mismatched_tags_never_complete() {
        let encoder = XmlEncoder::new();
        assert!(encoder.try_extract(b"<a></b>").unwrap().is_none());
        assert!(encoder.decode(b"<a></b>").is_err());
    }

    #[test]
    fn test_text_before_root_rejected() {
        let encoder = XmlEncoder::new();
        assert!(matches!(
            encoder.try_extract(b"hello <a/>"),
            Err(WireError::Xml(_))
        ));
    }

    #[test]
    fn test_decode_round_trip() {
        let encoder = XmlEncoder::new();
        let doc = "<note><to>you</to></note>".to_string();
        let bytes = encoder.encode(&doc).unwrap();
        assert_eq!(encoder.decode(&bytes).unwrap(), doc);
    }
}
