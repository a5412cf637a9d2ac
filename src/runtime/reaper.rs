//! Background liveness sweep (spec.md §4.6).
//!
//! The reaper periodically probes every registered connection for a dead
//! peer (a socket that is readable but reports zero bytes available,
//! i.e. has seen EOF) and removes it from the registry. It deliberately
//! does *not* close the file descriptor or return the connection's
//! `IoContext` to the pool — see the note on `sweep_once` for why.

use crate::runtime::connection::ConnectionRegistry;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// Reaper timing. Production default is "first sweep after 1s, then every
/// 5s" per spec.md §4.6; tests construct a shorter interval so scenarios
/// don't have to sleep for real wall-clock seconds.
#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub first_fire: Duration,
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            first_fire: Duration::from_secs(1),
            interval: Duration::from_secs(5),
        }
    }
}

/// Spawn the reaper thread. The returned handle runs until `shutting_down`
/// is observed true, at which point the thread exits — the reaper is not
/// part of the ordered close sequence in §4.7, it just stops looking.
pub fn spawn(
    registry: Arc<ConnectionRegistry>,
    config: ReaperConfig,
    shutting_down: Arc<std::sync::atomic::AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("reaper".into())
        .spawn(move || {
            std::thread::sleep(config.first_fire);
            loop {
                if shutting_down.load(std::sync::atomic::Ordering::Acquire) {
                    return;
                }
                sweep_once(&registry);
                std::thread::sleep(config.interval);
            }
        })
        .expect("failed to spawn reaper thread")
}

/// Probe every live connection once and drop dead ones from the registry.
///
/// This only removes the registry entry. It does not shut down the
/// socket and does not push the connection's `IoContext` back to the
/// pool. spec.md §9 flags the source's never-closing-the-socket behavior
/// as a likely bug and suggests running the full close path here instead.
/// That "fix" is not applied: the worker thread that owns the live
/// `mio::net::TcpStream` and the `IoContext` may still be mid-`feed` on
/// another thread when the reaper fires. If the reaper pushed the
/// `IoContext` back to the pool concurrently, a second accepted
/// connection could pop and start writing into the same buffer the first
/// worker is still using — violating the "no context is held by two
/// connections at once" property (spec.md §8). Leaving the fd and the
/// `IoContext` alone and letting the worker's own EOF/error detection
/// drive the real close keeps that property intact.
pub fn sweep_once(registry: &ConnectionRegistry) {
    for (id, fd) in registry.snapshot_fds() {
        if !is_live(fd) {
            if registry.remove(id).is_some() {
                debug!(conn_id = id, fd, "reaper removed dead connection");
            }
        }
    }
}

/// A socket is "dead" if it is readable right now but has zero bytes
/// available — the standard signal that the peer has sent EOF. Approximates
/// spec.md's "poll-readable then check bytes available" probe with a
/// zero-timeout `poll()` plus `FIONREAD`.
fn is_live(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    // SAFETY: `pfd` is a single well-formed pollfd on the stack, and a
    // zero timeout means poll cannot block.
    let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
    if ready <= 0 || pfd.revents & libc::POLLIN == 0 {
        // Not readable right now: either idle-but-alive (nothing to read
        // yet) or poll itself failed. Either way, not provably dead.
        return true;
    }

    let mut available: libc::c_int = 0;
    // SAFETY: `fd` is a valid, open descriptor owned by the registry;
    // `available` is a valid out-pointer for FIONREAD's `int`.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
    if rc != 0 {
        return true;
    }

    available > 0
}
