//! Minimal HTTP request handling.
//!
//! The appliance speaks HTTP only to accept WebSocket upgrades on its
//! single listen port; everything else receives a terse error. Static-file
//! serving is throttled appliance-side through the streaming engine's
//! `http_permitted` flag and lives outside this crate.

#[derive(Debug, Default)]
pub struct RequestHeaders {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub origin: Option<String>,
    pub upgrade: Option<String>,
    pub connection: Option<String>,
    pub sec_websocket_key: Option<String>,
    pub sec_websocket_version: Option<String>,
}

pub const BAD_REQUEST: &str =
    "HTTP/1.1 400 Bad request\r\nConnection: close\r\nContent-Length: 18\r\n\r\nRequest too short.";

pub const NOT_FOUND: &str =
    "HTTP/1.1 404 Not found\r\nConnection: close\r\nContent-Length: 10\r\n\r\nNot found.";

/// Parses the request line and the headers relevant for an upgrade.
/// Returns None when the bytes are not a parseable HTTP request head.
pub fn parse_request(data: &[u8]) -> Option<RequestHeaders> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    parts.next()?; // HTTP version

    let mut headers = RequestHeaders {
        method,
        path,
        ..Default::default()
    };

    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let value = value.trim().to_string();
        match name.trim().to_ascii_lowercase().as_str() {
            "host" => headers.host = Some(value),
            "origin" => headers.origin = Some(value),
            "upgrade" => headers.upgrade = Some(value),
            "connection" => headers.connection = Some(value),
            "sec-websocket-key" => headers.sec_websocket_key = Some(value),
            "sec-websocket-version" => headers.sec_websocket_version = Some(value),
            _ => {}
        }
    }

    Some(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::websocket;

    const UPGRADE_REQUEST: &str = "GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\nOrigin: x\r\nSec-WebSocket-Key: bhAe5LVdrInTKRkqQ6KgUA==\r\nSec-WebSocket-Version: \"13\"\r\n\r\n";

    #[test]
    fn test_parse_upgrade_request() {
        let headers = parse_request(UPGRADE_REQUEST.as_bytes()).unwrap();
        assert_eq!(headers.method, "GET");
        assert_eq!(headers.path, "/ws");
        assert_eq!(headers.host.as_deref(), Some("x"));
        assert_eq!(
            headers.sec_websocket_key.as_deref(),
            Some("bhAe5LVdrInTKRkqQ6KgUA==")
        );
        assert!(websocket::verify_headers(&headers));
    }

    #[test]
    fn test_missing_headers_fail_verification() {
        let headers =
            parse_request("GET / HTTP/1.1\r\nHost: x\r\n\r\n".as_bytes()).unwrap();
        assert!(!websocket::verify_headers(&headers));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_request(&[0xFF, 0xFE, 0x00]).is_none());
        assert!(parse_request(b"GARBAGE").is_none());
    }
}
