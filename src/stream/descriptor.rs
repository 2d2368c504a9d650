//! Data descriptors: the unit exchanged between producers and the sender
//! fibers.
//!
//! A descriptor either copies its payload into an internal buffer or borrows
//! caller-owned memory (large FFT frames). Either way the producer must
//! guarantee 7 writable bytes in front of the payload; the 3-byte ADCP
//! header and, when the payload fits the short form, a 2- or 4-byte
//! WebSocket binary header are written into that slack so both framings
//! share the payload bytes. Each descriptor tracks per-connection delivery
//! and an optional completion callback.

use parking_lot::Mutex;

use crate::config::{
    DATA_DESCRIPTOR_BUFFER_RESERVED, DATA_DESCRIPTOR_BUFFER_SIZE, DATA_DESCRIPTOR_USER_SPACE,
    MAX_CONNECTIONS,
};

/// First byte of an unfragmented binary WebSocket frame (FIN + opcode 2).
pub const WEBSOCKET_BINARY_HEADER: u8 = 0x82;

/// Raw pointer into caller-owned payload memory. Producers hand these to the
/// sender fibers; the memory stays valid until the completion callback fires
/// (for the FFT path this is enforced by the channel's dirty flag).
#[derive(Debug, Clone, Copy)]
pub struct SendPtr(pub *mut u8);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Invoked once the descriptor has been delivered to every connection.
pub type Completion = Box<dyn FnOnce() + Send>;

enum Payload {
    Empty,
    /// Payload copied into `data`; frame offsets index into `data`.
    Inline {
        adcp_off: usize,
        adcp_len: usize,
        ws_off: usize,
        ws_len: usize,
    },
    /// Payload borrowed from the producer; headers were written in front of
    /// the borrowed bytes.
    External {
        adcp: SendPtr,
        adcp_len: usize,
        ws: SendPtr,
        ws_len: usize,
    },
}

pub struct DescriptorBody {
    pub send_type: u8,
    data: Box<[u8; DATA_DESCRIPTOR_BUFFER_SIZE]>,
    payload: Payload,
    pub delivered: [bool; MAX_CONNECTIONS],
    pub callback: Option<Completion>,
}

pub struct DataDescriptor {
    body: Mutex<DescriptorBody>,
}

impl DataDescriptor {
    pub fn new() -> Self {
        DataDescriptor {
            body: Mutex::new(DescriptorBody {
                send_type: 0,
                data: Box::new([0u8; DATA_DESCRIPTOR_BUFFER_SIZE]),
                payload: Payload::Empty,
                delivered: [false; MAX_CONNECTIONS],
                callback: None,
            }),
        }
    }

    pub fn body(&self) -> &Mutex<DescriptorBody> {
        &self.body
    }
}

impl Default for DataDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the 3-byte ADCP header directly in front of `payload` and returns
/// the framed length. The caller guarantees the slack exists.
unsafe fn write_adcp_header(payload: *mut u8, send_type: u8, payload_len: usize) -> usize {
    let begin = payload.sub(3);
    *begin = send_type;
    let len = (payload_len as u16).to_le_bytes();
    *begin.add(1) = len[0];
    *begin.add(2) = len[1];
    payload_len + 3
}

/// Writes the WebSocket binary header in front of an already ADCP-framed
/// message. Returns (start, total length). Short frames use the 2-byte form;
/// longer ones the 4-byte form with the extended-length marker byte 127 and
/// a 16-bit big-endian length.
unsafe fn write_ws_header(adcp_begin: *mut u8, adcp_len: usize) -> (*mut u8, usize) {
    if adcp_len >= 126 {
        let begin = adcp_begin.sub(4);
        *begin = WEBSOCKET_BINARY_HEADER;
        *begin.add(1) = 127;
        *begin.add(2) = ((adcp_len >> 8) & 0xFF) as u8;
        *begin.add(3) = (adcp_len & 0xFF) as u8;
        (begin, adcp_len + 4)
    } else {
        let begin = adcp_begin.sub(2);
        *begin = WEBSOCKET_BINARY_HEADER;
        *begin.add(1) = adcp_len as u8;
        (begin, adcp_len + 2)
    }
}

impl DescriptorBody {
    /// Fills the descriptor with a copied payload. Panics if the payload
    /// exceeds the internal buffer; producers size their payloads to fit.
    pub fn prepare_copy(&mut self, send_type: u8, payload: &[u8], callback: Option<Completion>) {
        assert!(
            payload.len() <= DATA_DESCRIPTOR_USER_SPACE,
            "descriptor payload of {} bytes exceeds user space",
            payload.len()
        );
        let off = DATA_DESCRIPTOR_BUFFER_RESERVED;
        self.data[off..off + payload.len()].copy_from_slice(payload);

        let base = self.data.as_mut_ptr();
        let (adcp_off, adcp_len, ws_off, ws_len) = unsafe {
            let payload_ptr = base.add(off);
            let adcp_len = write_adcp_header(payload_ptr, send_type, payload.len());
            let (ws_ptr, ws_len) = write_ws_header(payload_ptr.sub(3), adcp_len);
            (
                off - 3,
                adcp_len,
                ws_ptr.offset_from(base) as usize,
                ws_len,
            )
        };
        self.payload = Payload::Inline {
            adcp_off,
            adcp_len,
            ws_off,
            ws_len,
        };
        self.finish_prepare(send_type, callback);
    }

    /// Fills the descriptor with a borrowed payload. The byte range
    /// [payload - 7, payload + len) must stay valid and writable until the
    /// completion callback has fired.
    pub fn prepare_borrowed(
        &mut self,
        send_type: u8,
        payload: SendPtr,
        len: usize,
        callback: Option<Completion>,
    ) {
        let (adcp, adcp_len, ws, ws_len) = unsafe {
            let adcp_len = write_adcp_header(payload.0, send_type, len);
            let adcp_begin = payload.0.sub(3);
            let (ws_ptr, ws_len) = write_ws_header(adcp_begin, adcp_len);
            (SendPtr(adcp_begin), adcp_len, SendPtr(ws_ptr), ws_len)
        };
        self.payload = Payload::External {
            adcp,
            adcp_len,
            ws,
            ws_len,
        };
        self.finish_prepare(send_type, callback);
    }

    fn finish_prepare(&mut self, send_type: u8, callback: Option<Completion>) {
        self.send_type = send_type;
        self.delivered = [false; MAX_CONNECTIONS];
        self.callback = callback;
    }

    /// The message as sent over a raw ADCP/TCP connection.
    pub fn adcp_frame(&self) -> &[u8] {
        match &self.payload {
            Payload::Empty => &[],
            Payload::Inline {
                adcp_off, adcp_len, ..
            } => &self.data[*adcp_off..*adcp_off + *adcp_len],
            Payload::External { adcp, adcp_len, .. } => unsafe {
                std::slice::from_raw_parts(adcp.0, *adcp_len)
            },
        }
    }

    /// The message as sent inside a WebSocket binary frame.
    pub fn ws_frame(&self) -> &[u8] {
        match &self.payload {
            Payload::Empty => &[],
            Payload::Inline { ws_off, ws_len, .. } => &self.data[*ws_off..*ws_off + *ws_len],
            Payload::External { ws, ws_len, .. } => unsafe {
                std::slice::from_raw_parts(ws.0, *ws_len)
            },
        }
    }

    pub fn delivered_to_all(&self, connection_count: usize) -> bool {
        self.delivered[..connection_count].iter().all(|d| *d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SEND_TYPE_DATA;

    #[test]
    fn test_inline_short_frame_headers() {
        let d = DataDescriptor::new();
        let mut body = d.body().lock();
        body.prepare_copy(SEND_TYPE_DATA, &[0xAA, 0xBB, 0xCC], None);

        let adcp = body.adcp_frame();
        assert_eq!(adcp, &[SEND_TYPE_DATA, 3, 0, 0xAA, 0xBB, 0xCC]);

        // 6-byte ADCP frame -> short 2-byte WS header.
        let ws = body.ws_frame();
        assert_eq!(&ws[..2], &[WEBSOCKET_BINARY_HEADER, 6]);
        assert_eq!(&ws[2..], adcp);
    }

    #[test]
    fn test_inline_extended_ws_header() {
        let payload = vec![0x55u8; 200];
        let d = DataDescriptor::new();
        let mut body = d.body().lock();
        body.prepare_copy(SEND_TYPE_DATA, &payload, None);

        let adcp_len = payload.len() + 3;
        let ws = body.ws_frame();
        assert_eq!(ws.len(), adcp_len + 4);
        assert_eq!(ws[0], WEBSOCKET_BINARY_HEADER);
        assert_eq!(ws[1], 127);
        assert_eq!(((ws[2] as usize) << 8) | ws[3] as usize, adcp_len);
        assert_eq!(&ws[4..], body.adcp_frame());
    }

    #[test]
    fn test_borrowed_payload_headers_in_slack() {
        let mut backing = vec![0u8; DATA_DESCRIPTOR_BUFFER_RESERVED + 10];
        for (i, b) in backing[DATA_DESCRIPTOR_BUFFER_RESERVED..].iter_mut().enumerate() {
            *b = i as u8;
        }
        let payload = SendPtr(unsafe {
            backing.as_mut_ptr().add(DATA_DESCRIPTOR_BUFFER_RESERVED)
        });

        let d = DataDescriptor::new();
        let mut body = d.body().lock();
        body.prepare_borrowed(SEND_TYPE_DATA, payload, 10, None);

        let adcp = body.adcp_frame();
        assert_eq!(&adcp[..3], &[SEND_TYPE_DATA, 10, 0]);
        assert_eq!(&adcp[3..], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let ws = body.ws_frame();
        assert_eq!(&ws[..2], &[WEBSOCKET_BINARY_HEADER, 13]);
        drop(body);
        drop(backing);
    }

    #[test]
    fn test_delivery_bitmap() {
        let d = DataDescriptor::new();
        let mut body = d.body().lock();
        body.prepare_copy(SEND_TYPE_DATA, &[1], None);
        assert!(!body.delivered_to_all(2));
        body.delivered[0] = true;
        assert!(!body.delivered_to_all(2));
        body.delivered[1] = true;
        assert!(body.delivered_to_all(2));
    }
}
