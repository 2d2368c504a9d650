//! WebSocket server side: RFC 6455 handshake and frame codec.
//!
//! Only what the appliance needs: unfragmented, masked client frames with
//! payloads up to 64K, binary data frames carrying ADCP messages, and the
//! close/ping/pong control opcodes. Outgoing frames are built by the
//! descriptor layer for streamed data; the helpers here cover the
//! handshake and direct responses.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::ResponseCode;
use crate::net::http::RequestHeaders;
use crate::stream::descriptor::WEBSOCKET_BINARY_HEADER;

pub const WEBSOCKET_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WEBSOCKET_KEY_LENGTH: usize = 24;

pub const OPCODE_TEXT: u8 = 1;
pub const OPCODE_BINARY: u8 = 2;
pub const OPCODE_CLOSE: u8 = 8;
pub const OPCODE_PING: u8 = 9;
pub const OPCODE_PONG: u8 = 10;

/// Close frame: FIN + opcode 8, no payload.
pub const CLOSE_FRAME: [u8; 2] = [0x88, 0x00];

/// One-byte error reply used when no buffer could be allocated.
pub const NO_MEM_FRAME: [u8; 3] = [
    WEBSOCKET_BINARY_HEADER,
    1,
    ResponseCode::NoMemory as u8,
];

#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub opcode: u8,
    pub payload: &'a [u8],
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    TooShort,
    Fragmented,
    ReservedBits,
    Unmasked,
    OversizedPayload,
    LengthMismatch,
    UnsupportedOpcode(u8),
}

/// Parses one client frame, unmasking the payload in place.
pub fn parse_frame(data: &mut [u8]) -> Result<Frame<'_>, FrameError> {
    // Header (2 bytes) plus masking key (4 bytes) at minimum.
    if data.len() < 6 {
        return Err(FrameError::TooShort);
    }

    let fin = data[0] & 0x80 != 0;
    let rsv = data[0] & 0x70;
    let opcode = data[0] & 0x0F;
    let masked = data[1] & 0x80 != 0;

    if !fin {
        return Err(FrameError::Fragmented);
    }
    if rsv != 0 {
        return Err(FrameError::ReservedBits);
    }
    if !masked {
        return Err(FrameError::Unmasked);
    }

    let mut offset = 2;
    let mut payload_length = (data[1] & 0x7F) as usize;
    if payload_length == 126 {
        if data.len() < 8 {
            return Err(FrameError::TooShort);
        }
        payload_length = ((data[2] as usize) << 8) | data[3] as usize;
        offset += 2;
    } else if payload_length == 127 {
        // 64-bit lengths exceed anything this protocol carries.
        return Err(FrameError::OversizedPayload);
    }

    let masking_key = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
    offset += 4;

    if data.len() - offset != payload_length {
        return Err(FrameError::LengthMismatch);
    }

    let payload = &mut data[offset..];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= masking_key[i & 3];
    }

    match opcode {
        OPCODE_TEXT | OPCODE_BINARY | OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG => Ok(Frame {
            opcode,
            payload: &data[offset..],
        }),
        other => Err(FrameError::UnsupportedOpcode(other)),
    }
}

/// Server-to-client frame around an already assembled message.
pub fn server_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(0x80 | opcode);
    if payload.len() >= 126 {
        // Extended 16-bit length; the marker byte is 127 for compatibility
        // with the deployed clients.
        out.push(127);
        out.push(((payload.len() >> 8) & 0xFF) as u8);
        out.push((payload.len() & 0xFF) as u8);
    } else {
        out.push(payload.len() as u8);
    }
    out.extend_from_slice(payload);
    out
}

pub fn pong_frame(payload: &[u8]) -> Vec<u8> {
    server_frame(OPCODE_PONG, payload)
}

/// A key is 22 base64 characters followed by two padding characters; the
/// decoded value does not matter.
pub fn is_valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    if bytes.len() != WEBSOCKET_KEY_LENGTH
        || bytes[WEBSOCKET_KEY_LENGTH - 1] != b'='
        || bytes[WEBSOCKET_KEY_LENGTH - 2] != b'='
    {
        return false;
    }
    bytes[..22]
        .iter()
        .all(|&c| c.is_ascii_alphanumeric() || c == b'+' || c == b'/')
}

/// The Sec-WebSocket-Accept value: base64 of the SHA-1 over key ++ magic.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}

/// All conditions a request must meet to switch protocols.
pub fn verify_headers(headers: &RequestHeaders) -> bool {
    if headers.host.is_none() || headers.origin.is_none() {
        return false;
    }
    match &headers.upgrade {
        Some(v) if contains_ignore_case(v, "websocket") => {}
        _ => return false,
    }
    match &headers.connection {
        Some(v) if contains_ignore_case(v, "upgrade") => {}
        _ => return false,
    }
    match &headers.sec_websocket_key {
        Some(k) if is_valid_key(k) => {}
        _ => return false,
    }
    match &headers.sec_websocket_version {
        // Some clients quote the version value.
        Some(v) if v.trim_matches('"') == "13" => {}
        _ => return false,
    }
    true
}

/// The complete 101 response for a verified upgrade request.
pub fn handshake_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: WebSocket\r\nConnection: upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_reference_vector() {
        // RFC 6455 section 1.3 example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("bhAe5LVdrInTKRkqQ6KgUA=="));
        assert!(!is_valid_key("bhAe5LVdrInTKRkqQ6KgUA="));
        assert!(!is_valid_key("bhAe5LVdrInTKRkqQ6K?UA=="));
        assert!(!is_valid_key(""));
    }

    fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let key = [0x11u8, 0x22, 0x33, 0x44];
        let mut out = vec![0x80 | opcode];
        if payload.len() >= 126 {
            out.push(0x80 | 126);
            out.push((payload.len() >> 8) as u8);
            out.push((payload.len() & 0xFF) as u8);
        } else {
            out.push(0x80 | payload.len() as u8);
        }
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i & 3]));
        out
    }

    #[test]
    fn test_parse_unmasks_payload() {
        let mut data = masked_frame(OPCODE_BINARY, &[1, 2, 3, 4, 5]);
        let frame = parse_frame(&mut data).unwrap();
        assert_eq!(frame.opcode, OPCODE_BINARY);
        assert_eq!(frame.payload, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_parse_extended_length() {
        let payload: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let mut data = masked_frame(OPCODE_BINARY, &payload);
        let frame = parse_frame(&mut data).unwrap();
        assert_eq!(frame.payload.len(), 300);
        assert_eq!(frame.payload, &payload[..]);
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        let mut short = vec![0x82, 0x81, 0x00];
        assert_eq!(parse_frame(&mut short), Err(FrameError::TooShort));

        let mut fragmented = masked_frame(OPCODE_BINARY, &[1]);
        fragmented[0] &= 0x7F;
        assert_eq!(parse_frame(&mut fragmented), Err(FrameError::Fragmented));

        let mut unmasked = masked_frame(OPCODE_BINARY, &[1]);
        unmasked[1] &= 0x7F;
        // Clearing the mask bit also shrinks the expected layout; the parser
        // must reject before reading a key.
        assert!(parse_frame(&mut unmasked).is_err());

        let mut reserved = masked_frame(OPCODE_BINARY, &[1]);
        reserved[0] |= 0x40;
        assert_eq!(parse_frame(&mut reserved), Err(FrameError::ReservedBits));
    }

    #[test]
    fn test_server_frame_lengths() {
        let short = server_frame(OPCODE_BINARY, &[0; 10]);
        assert_eq!(&short[..2], &[0x82, 10]);

        let long = server_frame(OPCODE_BINARY, &[0; 500]);
        assert_eq!(long[0], 0x82);
        assert_eq!(long[1], 127);
        assert_eq!(((long[2] as usize) << 8) | long[3] as usize, 500);
    }
}
