//! TCP server: accept loop and per-connection tasks.
//!
//! One task per accepted socket, bounded by the connection registry. The
//! first message decides the protocol: the CONNECTION.SET_TYPE magic makes
//! it a raw ADCP connection, anything else is treated as HTTP, and a valid
//! upgrade request turns the connection into WebSocket-framed ADCP.

pub mod adcp;
pub mod connection;
pub mod http;
pub mod websocket;

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{CONNECTION_BUFFER_SIZE, SEND_TYPE_NONE};
use crate::instrument::Instrument;

use adcp::Disposition;
use connection::{Connection, ConnectionType, CONNECT_MAGIC};

static CONNECTION_ID_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Builds the listening socket with address reuse.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

/// Accept loop. Waits for a free connection slot before accepting so the
/// connection bound also bounds the backlog handed to tasks.
pub fn spawn_server(
    instrument: Arc<Instrument>,
    listener: TcpListener,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("server-accept".into())
        .spawn(move || {
            listener
                .set_nonblocking(true)
                .expect("nonblocking listener");

            while running.load(Ordering::Acquire) {
                if !instrument.connections.has_free_slot() {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }

                match listener.accept() {
                    Ok((stream, peer)) => {
                        accept_connection(&instrument, stream, peer, &running)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        })
        .expect("spawn accept loop")
}

fn accept_connection(
    instrument: &Arc<Instrument>,
    stream: TcpStream,
    peer: SocketAddr,
    running: &Arc<AtomicBool>,
) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_nonblocking(false);

    let read_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("could not clone stream for {}: {}", peer, e);
            return;
        }
    };

    let id = CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let conn = Arc::new(Connection::new(stream, peer, id));
    let slot = match instrument.connections.register(conn.clone()) {
        Some(slot) => slot,
        None => {
            // Raced with another accept; the free-slot check keeps this
            // rare. The socket simply closes.
            warn!("no connection slot for {}", peer);
            return;
        }
    };
    debug!("connection {} from {} in slot {}", id, peer, slot);

    let task_instrument = instrument.clone();
    let task_running = running.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("conn-{}", id))
        .spawn(move || connection_task(task_instrument, conn, read_stream, slot, task_running));
    if spawned.is_err() {
        instrument.connections.unregister(slot);
    }
}

/// The task for every open connection: receives messages and runs them
/// through the protocol layer.
fn connection_task(
    instrument: Arc<Instrument>,
    conn: Arc<Connection>,
    mut read_stream: TcpStream,
    slot: usize,
    running: Arc<AtomicBool>,
) {
    let _ = read_stream.set_read_timeout(Some(Duration::from_millis(200)));
    let mut buffer = vec![0u8; CONNECTION_BUFFER_SIZE];
    let mut disposition = Disposition::Continue;

    while disposition == Disposition::Continue && running.load(Ordering::Acquire) {
        match read_stream.read(&mut buffer) {
            Ok(0) => {
                info!("connection {} closed by peer", conn.id());
                break;
            }
            Ok(n) => {
                disposition = handle_message(&instrument, &conn, &mut buffer[..n]);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                info!("connection {} error: {}", conn.id(), e);
                break;
            }
        }
    }

    if disposition == Disposition::Exit {
        info!("connection {} closed by the server", conn.id());
    }
    instrument.connections.unregister(slot);
}

/// Dispatches one received chunk according to the connection type,
/// determining the type from the first bytes when still unknown.
fn handle_message(
    instrument: &Arc<Instrument>,
    conn: &Arc<Connection>,
    data: &mut [u8],
) -> Disposition {
    if conn.conn_type() == ConnectionType::Unknown {
        if data.len() < 2 {
            let _ = conn.write(http::BAD_REQUEST.as_bytes());
            return Disposition::Exit;
        }
        if data[..2] == CONNECT_MAGIC {
            conn.set_conn_type(ConnectionType::Tcp);
            conn.set_send_type(if data.len() > 2 { data[2] } else { SEND_TYPE_NONE });
        } else {
            conn.set_conn_type(ConnectionType::Http);
        }
    }

    match conn.conn_type() {
        ConnectionType::Tcp => handle_tcp(instrument, conn, data),
        ConnectionType::Http => handle_http(conn, data),
        ConnectionType::WebSocket => handle_websocket(instrument, conn, data),
        ConnectionType::Unknown => unreachable!("connection type decided above"),
    }
}

fn handle_tcp(
    instrument: &Arc<Instrument>,
    conn: &Arc<Connection>,
    data: &[u8],
) -> Disposition {
    let (payload, disposition) = adcp::handle_command(instrument, conn, data);
    let framed = adcp::frame(SEND_TYPE_NONE, &payload);
    if conn.write(&framed).is_err() {
        return Disposition::Exit;
    }
    disposition
}

fn handle_http(conn: &Arc<Connection>, data: &[u8]) -> Disposition {
    let headers = match http::parse_request(data) {
        Some(headers) => headers,
        None => {
            let _ = conn.write(http::BAD_REQUEST.as_bytes());
            return Disposition::Exit;
        }
    };

    if websocket::verify_headers(&headers) {
        let key = headers.sec_websocket_key.as_deref().unwrap_or_default();
        if conn
            .write(websocket::handshake_response(key).as_bytes())
            .is_err()
        {
            return Disposition::Exit;
        }
        conn.set_conn_type(ConnectionType::WebSocket);
        return Disposition::Continue;
    }

    // Static files are served elsewhere; plain requests get a terse no.
    let _ = conn.write(http::NOT_FOUND.as_bytes());
    Disposition::Exit
}

fn handle_websocket(
    instrument: &Arc<Instrument>,
    conn: &Arc<Connection>,
    data: &mut [u8],
) -> Disposition {
    let frame = match websocket::parse_frame(data) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("connection {}: bad websocket frame: {:?}", conn.id(), e);
            return Disposition::Exit;
        }
    };

    match frame.opcode {
        websocket::OPCODE_BINARY => {
            let (payload, disposition) = adcp::handle_command(instrument, conn, frame.payload);
            let framed = adcp::frame(SEND_TYPE_NONE, &payload);
            let ws = websocket::server_frame(websocket::OPCODE_BINARY, &framed);
            if conn.write(&ws).is_err() {
                return Disposition::Exit;
            }
            disposition
        }
        websocket::OPCODE_CLOSE => {
            let _ = conn.write(&websocket::CLOSE_FRAME);
            Disposition::Exit
        }
        websocket::OPCODE_PING => {
            let _ = conn.write(&websocket::pong_frame(frame.payload));
            Disposition::Continue
        }
        websocket::OPCODE_PONG => Disposition::Continue,
        _ => {
            // Text frames have no meaning here.
            Disposition::Exit
        }
    }
}
