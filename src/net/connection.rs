//! Client connection bookkeeping.
//!
//! Every accepted socket occupies one slot in the connection registry until
//! its task ends. The slot index doubles as the position in each
//! descriptor's delivery bitmap. A connection starts out with an unknown
//! type; the first bytes it sends decide between raw ADCP and HTTP, and an
//! HTTP upgrade turns it into a WebSocket connection.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{MAX_CONNECTIONS, SEND_TYPE_NONE};
use crate::pool::Pool;

/// Leading bytes of a raw ADCP connection's first message: the
/// CONNECTION.SET_TYPE command doubles as the protocol magic.
pub const CONNECT_MAGIC: [u8; 2] = [0x10, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionType {
    Unknown = 0,
    Http = 1,
    WebSocket = 2,
    Tcp = 3,
}

impl ConnectionType {
    fn from_u8(v: u8) -> ConnectionType {
        match v {
            1 => ConnectionType::Http,
            2 => ConnectionType::WebSocket,
            3 => ConnectionType::Tcp,
            _ => ConnectionType::Unknown,
        }
    }
}

pub struct Connection {
    /// The write channel. Senders try-lock and skip a tick on contention.
    stream: Mutex<TcpStream>,
    conn_type: AtomicU8,
    send_type: AtomicU8,
    peer: SocketAddr,
    id: u16,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, id: u16) -> Self {
        Connection {
            stream: Mutex::new(stream),
            conn_type: AtomicU8::new(ConnectionType::Unknown as u8),
            send_type: AtomicU8::new(SEND_TYPE_NONE),
            peer,
            id,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn conn_type(&self) -> ConnectionType {
        ConnectionType::from_u8(self.conn_type.load(Ordering::Acquire))
    }

    pub fn set_conn_type(&self, t: ConnectionType) {
        self.conn_type.store(t as u8, Ordering::Release);
    }

    pub fn send_type(&self) -> u8 {
        self.send_type.load(Ordering::Acquire)
    }

    pub fn set_send_type(&self, mask: u8) {
        self.send_type.store(mask, Ordering::Release);
    }

    /// Blocking write used by the connection's own task (command responses).
    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(bytes)
    }

    /// Non-blocking-ish write used by the sender fibers: give up after the
    /// advisory timeout so one stuck connection cannot stall a whole stream.
    pub fn try_write_for(&self, timeout: Duration, bytes: &[u8]) -> Option<std::io::Result<()>> {
        let mut stream = self.stream.try_lock_for(timeout)?;
        Some(stream.write_all(bytes))
    }
}

/// Slot table of active connections, shared between the accept loop, the
/// connection tasks and the sender fibers.
pub struct ConnectionRegistry {
    pool: Pool<Mutex<Option<Arc<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            pool: Pool::from_fn(MAX_CONNECTIONS, |_| Mutex::new(None)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn active_count(&self) -> usize {
        self.pool.used_count()
    }

    pub fn has_free_slot(&self) -> bool {
        self.pool.free_count() > 0
    }

    pub fn register(&self, connection: Arc<Connection>) -> Option<usize> {
        let index = self.pool.allocate()?;
        *self.pool.get(index).lock() = Some(connection);
        Some(index)
    }

    pub fn unregister(&self, index: usize) {
        *self.pool.get(index).lock() = None;
        self.pool.free(index);
    }

    pub fn get(&self, index: usize) -> Option<Arc<Connection>> {
        if !self.pool.is_used(index) {
            return None;
        }
        self.pool.get(index).lock().clone()
    }

    /// Human-readable per-slot summary for the debugging command.
    pub fn stats_string(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::from("Connections:\n");
        for index in 0..self.capacity() {
            match self.get(index) {
                None => {
                    let _ = writeln!(out, "{}: -", index);
                }
                Some(c) => {
                    let kind = match c.conn_type() {
                        ConnectionType::Unknown => "Unknown",
                        ConnectionType::Http => "HTTP",
                        ConnectionType::WebSocket => "WS",
                        ConnectionType::Tcp => "TCP",
                    };
                    let mut subs = String::new();
                    let mask = c.send_type();
                    if mask == SEND_TYPE_NONE {
                        subs.push_str(" None");
                    }
                    for (bit, name) in [
                        (crate::config::SEND_TYPE_DEBUG, " Debug"),
                        (crate::config::SEND_TYPE_STATUS, " Status"),
                        (crate::config::SEND_TYPE_DATA, " Data"),
                        (crate::config::SEND_TYPE_FFT, " FFT"),
                    ] {
                        if mask & bit != 0 {
                            subs.push_str(name);
                        }
                    }
                    let _ = writeln!(
                        out,
                        "{}: Connectiontype {}, Datatype{} ({})",
                        index, kind, subs, c.peer()
                    );
                }
            }
        }
        out
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_registry_slots_and_limits() {
        let registry = ConnectionRegistry::new();
        assert!(registry.has_free_slot());

        let mut slots = Vec::new();
        let mut keep = Vec::new();
        for i in 0..MAX_CONNECTIONS {
            let (client, server) = loopback_pair();
            keep.push(client);
            let peer = server.peer_addr().unwrap();
            let conn = Arc::new(Connection::new(server, peer, i as u16));
            slots.push(registry.register(conn).unwrap());
        }
        assert!(!registry.has_free_slot());
        assert_eq!(registry.active_count(), MAX_CONNECTIONS);

        registry.unregister(slots[3]);
        assert!(registry.has_free_slot());
        assert!(registry.get(slots[3]).is_none());
    }

    #[test]
    fn test_send_type_matching_default_none() {
        let (_client, server) = loopback_pair();
        let peer = server.peer_addr().unwrap();
        let conn = Connection::new(server, peer, 0);
        assert_eq!(conn.send_type(), SEND_TYPE_NONE);
        conn.set_send_type(crate::config::SEND_TYPE_DATA | crate::config::SEND_TYPE_STATUS);
        assert_eq!(conn.send_type() & crate::config::SEND_TYPE_DATA, crate::config::SEND_TYPE_DATA);
    }
}
