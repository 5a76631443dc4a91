//! WebSocket opening handshake (RFC 6455 section 4).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::WireError;

/// GUID appended to the client key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Blank line ending the HTTP header block
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Value of the first header named `name`, compared case-insensitively
pub fn header<'a>(message: &'a str, name: &str) -> Option<&'a str> {
    message
        .split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

/// `Sec-WebSocket-Key` of an upgrade request
pub fn extract_key(request: &str) -> Option<&str> {
    header(request, "Sec-WebSocket-Key").filter(|key| !key.is_empty())
}

/// Build the `101 Switching Protocols` answer to an upgrade request
pub fn respond(request: &str) -> Result<String, WireError> {
    if !request.starts_with("GET ") {
        return Err(WireError::Handshake("expected a GET request".to_string()));
    }
    let key = extract_key(request)
        .ok_or_else(|| WireError::Handshake("missing Sec-WebSocket-Key".to_string()))?;

    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    ))
}

/// Random base64 client key
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Build a client upgrade request
pub fn client_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Check a server answer against the key the client sent
pub fn verify_response(response: &str, key: &str) -> Result<(), WireError> {
    let status_line = response.split("\r\n").next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
        return Err(WireError::Handshake("missing status line".to_string()));
    };
    if !version.starts_with("HTTP/") || status != "101" {
        return Err(WireError::Handshake(format!(
            "unexpected status line: {status_line}"
        )));
    }

    let accept = header(response, "Sec-WebSocket-Accept")
        .ok_or_else(|| WireError::Handshake("missing Sec-WebSocket-Accept".to_string()))?;
    if accept != accept_key(key) {
        return Err(WireError::Handshake("accept value does not match key".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn test_rfc_accept_value() {
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_respond_to_request() {
        let request = client_request("example.com", "/chat", SAMPLE_KEY);
        let response = respond(&request).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_key_header_case_insensitive() {
        let request = "GET / HTTP/1.1\r\nsec-websocket-key:  abc== \r\n\r\n";
        assert_eq!(extract_key(request), Some("abc=="));
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let request = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(matches!(respond(request), Err(WireError::Handshake(_))));
        assert!(matches!(respond("POST / HTTP/1.1\r\n\r\n"), Err(WireError::Handshake(_))));
    }

    #[test]
    fn test_client_verifies_response() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);

        let response = respond(&client_request("h", "/", &key)).unwrap();
        verify_response(&response, &key).unwrap();
        assert!(verify_response(&response, SAMPLE_KEY).is_err());
        assert!(verify_response("HTTP/1.1 400 Bad Request\r\n\r\n", &key).is_err());
    }
}
