//! I/O runtime: acceptor/reactor threads, the connection registry, the
//! buffer pool, and the reaper (spec.md §4).
//!
//! spec.md §9 allows any of epoll, kqueue, IOCP, io_uring, an async
//! task-runtime, or a blocking thread-per-connection model, as long as
//! the per-connection state machine and the locking discipline in §5 are
//! preserved. This crate picks a single portable reactor built on `mio`
//! (epoll on Linux, kqueue on macOS/BSD) rather than carrying separate
//! io_uring and kqueue backends side by side — see `DESIGN.md` for why.
//! That choice makes the runtime unix-only; `spawn_workers` reports a
//! clean "unsupported platform" error everywhere else instead of failing
//! to compile.

pub mod connection;
pub mod io_context;
pub mod reaper;

#[cfg(unix)]
mod event_loop;

use crate::publish::PublishHook;
use connection::ConnectionRegistry;
use io_context::IoContextPool;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;

/// State shared by every worker thread and the reaper. Each field is
/// independently synchronized (or atomic); nothing here is ever locked
/// across an I/O syscall (spec.md §5).
pub(crate) struct ServerShared {
    pub registry: Arc<ConnectionRegistry>,
    pub pool: Arc<IoContextPool>,
    pub publish: Arc<PublishHook>,
    pub shutting_down: Arc<AtomicBool>,
    pub force_close: Arc<AtomicBool>,
    pub shutdown_logged: Arc<AtomicBool>,
    /// Counts worker threads still running. The last worker to exit during
    /// a shutdown is what actually fires the "all connections closed"
    /// line for a graceful drain, since nothing else is polling for that
    /// moment (`Server::stop(false)` returns immediately without joining).
    pub active_workers: AtomicUsize,
    pub max_body_len: u32,
    pub max_connections: usize,
}

/// Emit the "all connections closed, server shut down" line exactly once
/// per shutdown (spec.md §4.7 step 4, §8 properties 8–9), regardless of
/// whether it's observed from a connection's close path or from
/// `Server::stop` noticing there was nothing to close in the first place.
pub(crate) fn log_shutdown_complete_once(shared: &ServerShared) {
    use std::sync::atomic::Ordering;
    if shared
        .shutdown_logged
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        tracing::info!("all connections closed, server shut down");
    }
}

#[cfg(unix)]
pub(crate) use event_loop::spawn_workers;

#[cfg(not(unix))]
pub(crate) fn spawn_workers(
    _shared: Arc<ServerShared>,
    _host: &str,
    _port: u16,
    _workers: usize,
) -> std::io::Result<Vec<std::thread::JoinHandle<()>>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "framed-tcp-server's runtime requires a unix target (epoll/kqueue via mio)",
    ))
}
