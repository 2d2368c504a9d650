//! Global sizing and limits for the instrument.

/// Maximum number of concurrently served client connections.
pub const MAX_CONNECTIONS: usize = 8;

/// Maximum number of logical measurement channels the input multiplexer
/// is rotated across.
pub const MAX_MEASUREMENTS: usize = 10;

/// Default ADCP listen port.
pub const LISTEN_PORT: u16 = 80;

/// Number of value records in one data payload. 206 records give exactly
/// 8 + 206 * 7 = 1450 bytes of payload; with the 3-byte ADCP and 4-byte
/// WebSocket headers the frame stays below one Ethernet MTU (1460).
pub const VALUE_BUFFER_SIZE: usize = 206;

/// The reference tick is 10 microseconds. A value record stores its distance
/// to the buffer's time reference as u16 ticks, so the largest representable
/// span is 64 000 ticks (0.64 s) before the buffer must be flushed.
pub const MAX_TIMESTAMP_DELTA: u64 = 64_000;

pub const DEBUG_QUEUE_SIZE: usize = 16;
pub const STATUS_QUEUE_SIZE: usize = 16;
pub const DATA_QUEUE_SIZE: usize = 64;
pub const FFT_QUEUE_SIZE: usize = 16;

/// One shared descriptor pool feeds all four stream queues.
pub const DATA_DESCRIPTOR_POOL_SIZE: usize =
    DEBUG_QUEUE_SIZE + STATUS_QUEUE_SIZE + DATA_QUEUE_SIZE + FFT_QUEUE_SIZE;

/// Three times the MTU, about 4.2K. This allows a descriptor to carry 4K of
/// raw data plus header information without a second allocation.
pub const DATA_DESCRIPTOR_BUFFER_SIZE: usize = 3 * 1460;

/// Bytes reserved in front of every payload: 3 for the ADCP header and 4 for
/// the (possibly extended) WebSocket header, written in place.
pub const DATA_DESCRIPTOR_BUFFER_RESERVED: usize = 7;

/// Copyable payload space of one descriptor.
pub const DATA_DESCRIPTOR_USER_SPACE: usize =
    DATA_DESCRIPTOR_BUFFER_SIZE - DATA_DESCRIPTOR_BUFFER_RESERVED;

/// Subscription bits. A client publishes a bitmask of these; a descriptor is
/// delivered to a connection iff `descriptor.type & connection.send_type != 0`.
pub const SEND_TYPE_NONE: u8 = 0x00;
pub const SEND_TYPE_DEBUG: u8 = 0x01;
pub const SEND_TYPE_STATUS: u8 = 0x02;
pub const SEND_TYPE_DATA: u8 = 0x04;
pub const SEND_TYPE_FFT: u8 = 0x08;

/// Largest client message accepted on one connection.
pub const CONNECTION_BUFFER_SIZE: usize = (1 << 16) - 1;
