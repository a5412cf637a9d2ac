//! mio-based accept loop and per-worker reactor (spec.md §4.5, §4.7).
//!
//! Each worker thread owns one `SO_REUSEPORT` listener and its own
//! `mio::Poll`. The shared [`ConnectionRegistry`] holds only logical
//! connection state (phase, scratch buffer, fd); each worker keeps the
//! live `mio::net::TcpStream` in a thread-local `HashMap` keyed by the
//! same id the registry assigned on `insert`, so a connection's id is
//! simultaneously its registry key and its `mio::Token` — no separate
//! local/global id translation is needed, and I/O never happens while
//! the registry's mutex is held.

use super::connection::ConnectionState;
use super::ServerShared;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const READ_CHUNK: usize = 64 * 1024;
const LISTEN_BACKLOG: i32 = 100;

/// Bind all `workers` listeners up front (so a bind failure is reported
/// synchronously, before any thread starts) and spawn one worker per
/// listener.
pub(crate) fn spawn_workers(
    shared: Arc<ServerShared>,
    host: &str,
    port: u16,
    workers: usize,
) -> io::Result<Vec<JoinHandle<()>>> {
    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
        io::Error::new(ErrorKind::InvalidInput, format!("invalid listen address: {e}"))
    })?;

    let mut std_listeners = Vec::with_capacity(workers.max(1));
    for _ in 0..workers.max(1) {
        std_listeners.push(bind_reuseport(addr)?);
    }

    let mut handles = Vec::with_capacity(std_listeners.len());
    for (worker_id, std_listener) in std_listeners.into_iter().enumerate() {
        let shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("reactor-{worker_id}"))
            .spawn(move || {
                if let Err(err) = worker_loop(worker_id, std_listener, Arc::clone(&shared)) {
                    warn!(worker_id, error = %err, "reactor worker exited with error");
                }
                // The last worker to exit during a shutdown is the one that
                // knows the drain is actually complete; `Server::stop(false)`
                // itself returns without waiting for that.
                if shared.active_workers.fetch_sub(1, Ordering::AcqRel) == 1
                    && shared.shutting_down.load(Ordering::Acquire)
                {
                    super::log_shutdown_complete_once(&shared);
                }
            })
            .expect("failed to spawn reactor worker thread");
        handles.push(handle);
    }
    Ok(handles)
}

fn bind_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

fn worker_loop(worker_id: usize, std_listener: std::net::TcpListener, shared: Arc<ServerShared>) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut listener = TcpListener::from_std(std_listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut local: HashMap<usize, TcpStream> = HashMap::new();
    let mut events = Events::with_capacity(256);

    loop {
        if shared.force_close.load(Ordering::Acquire) {
            force_close_all(&mut local, &shared, poll.registry());
            return Ok(());
        }
        if shared.shutting_down.load(Ordering::Acquire) && local.is_empty() {
            return Ok(());
        }

        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_connections(worker_id, &listener, &mut local, &shared, poll.registry());
            } else {
                let conn_id = event.token().0;
                handle_readable(conn_id, &mut local, &shared, poll.registry());
            }
        }
    }
}

fn accept_connections(
    worker_id: usize,
    listener: &TcpListener,
    local: &mut HashMap<usize, TcpStream>,
    shared: &Arc<ServerShared>,
    registry: &mio::Registry,
) {
    loop {
        let (stream, _peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(worker_id, error = %e, "accept failed");
                return;
            }
        };

        if shared.shutting_down.load(Ordering::Acquire) {
            // draining, refuse new work
            continue;
        }
        if shared.registry.len() >= shared.max_connections {
            debug!(worker_id, "max_connections reached, dropping accepted socket");
            continue;
        }

        let mut stream = stream;
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&stream);
        let io_ctx = shared.pool.pop();
        let conn_id = shared.registry.insert(ConnectionState::new(fd, io_ctx));

        if let Err(e) = registry.register(&mut stream, Token(conn_id), Interest::READABLE) {
            warn!(worker_id, conn_id, error = %e, "failed to register accepted connection");
            if let Some(state) = shared.registry.remove(conn_id) {
                shared.pool.push(state.into_io_context());
            }
            continue;
        }

        local.insert(conn_id, stream);
        debug!(worker_id, conn_id, "accepted connection");
    }
}

fn handle_readable(
    conn_id: usize,
    local: &mut HashMap<usize, TcpStream>,
    shared: &Arc<ServerShared>,
    registry: &mio::Registry,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let stream = match local.get_mut(&conn_id) {
            Some(s) => s,
            None => return,
        };
        match stream.read(&mut buf) {
            Ok(0) => {
                close_one(conn_id, local, shared, registry);
                return;
            }
            Ok(n) => {
                if feed_and_publish(conn_id, &buf[..n], shared).is_err() {
                    close_one(conn_id, local, shared, registry);
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!(conn_id, error = %e, "transport error on read");
                close_one(conn_id, local, shared, registry);
                return;
            }
        }
    }
}

/// Drive the connection's receive state machine over one read's worth of
/// bytes, publishing each completed frame as it resolves. Loops because a
/// single `read()` can contain more than one frame back to back (spec.md
/// §8, S3).
fn feed_and_publish(conn_id: usize, mut data: &[u8], shared: &Arc<ServerShared>) -> Result<(), ()> {
    while !data.is_empty() {
        let step = shared
            .registry
            .with_mut(conn_id, |state| state.feed(data, shared.max_body_len));

        let (consumed, outcome) = match step {
            Some(Ok(pair)) => pair,
            Some(Err(frame_err)) => {
                warn!(conn_id, error = %frame_err, "malformed frame");
                return Err(());
            }
            None => return Err(()), // connection already gone (e.g. reaped)
        };

        data = &data[consumed..];

        if let super::connection::FeedOutcome::FrameComplete { opcode, body } = outcome {
            shared.publish.publish(opcode, &body);
        }
    }
    Ok(())
}

/// Idempotent close of one connection (spec.md §4.7). Only the call that
/// actually removes the registry entry pushes the `IoContext` back to the
/// pool and may emit the "all connections closed" log line.
fn close_one(conn_id: usize, local: &mut HashMap<usize, TcpStream>, shared: &Arc<ServerShared>, registry: &mio::Registry) {
    if let Some(mut stream) = local.remove(&conn_id) {
        let _ = registry.deregister(&mut stream);
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }

    if let Some(state) = shared.registry.remove(conn_id) {
        shared.pool.push(state.into_io_context());
        debug!(conn_id, "connection closed");
        if shared.shutting_down.load(Ordering::Acquire) && shared.registry.is_empty() {
            super::log_shutdown_complete_once(shared);
        }
    }
}

fn force_close_all(local: &mut HashMap<usize, TcpStream>, shared: &Arc<ServerShared>, registry: &mio::Registry) {
    let ids: Vec<usize> = local.keys().copied().collect();
    for id in ids {
        close_one(id, local, shared, registry);
    }
}
