//! Per-connection receive state machine (spec.md §3, §4.4).

use crate::codec::{check_body_len, parse_header, FrameError, HEADER_SIZE};
use crate::runtime::io_context::IoContext;
use slab::Slab;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// Where a connection currently is in the header/body receive cycle.
///
/// This replaces the sentinel `opcode = -1` / nullable body buffer of the
/// original design with a total encoding: there is no state in which
/// `opcode` or `body_len` are meaningful but unset (spec.md §9).
#[derive(Debug)]
pub enum Phase {
    ReadingHeader { filled: usize },
    ReadingBody { opcode: i16, body_len: u32, filled: usize },
}

/// Outcome of feeding newly-read bytes into a connection's state machine.
#[derive(Debug)]
pub enum FeedOutcome {
    NeedMoreHeader,
    NeedMoreBody,
    FrameComplete { opcode: i16, body: Vec<u8> },
}

/// One accepted client connection: its socket identity and receive
/// progress. A connection's state exists in the registry iff the socket
/// has not been closed by either side (spec.md §3).
pub struct ConnectionState {
    pub fd: RawFd,
    pub phase: Phase,
    io: IoContext,
}

impl ConnectionState {
    pub fn new(fd: RawFd, mut io: IoContext) -> Self {
        io.buf.clear();
        io.buf.resize(HEADER_SIZE, 0);
        Self {
            fd,
            phase: Phase::ReadingHeader { filled: 0 },
            io,
        }
    }

    fn reset_to_header(&mut self) {
        self.io.buf.clear();
        self.io.buf.resize(HEADER_SIZE, 0);
        self.phase = Phase::ReadingHeader { filled: 0 };
    }

    /// Consume a prefix of `data` to make progress on the current phase.
    ///
    /// Returns how many bytes were consumed and what happened. Never
    /// consumes more than needed to complete the current phase, so the
    /// caller can re-invoke this over the remainder of `data` to drain a
    /// single read that contained more than one frame (spec.md §8, S3).
    ///
    /// Byte counts are cumulative across calls (`filled` only ever grows
    /// within a phase), resolving spec.md §9's open question about the
    /// source comparing a single completion's size against `body_len`
    /// instead of the running total.
    pub fn feed(&mut self, data: &[u8], cap: u32) -> Result<(usize, FeedOutcome), FrameError> {
        debug_assert!(!data.is_empty());
        match &mut self.phase {
            Phase::ReadingHeader { filled } => {
                let need = HEADER_SIZE - *filled;
                let take = need.min(data.len());
                let start = *filled;
                self.io.buf[start..start + take].copy_from_slice(&data[..take]);
                *filled += take;
                if *filled < HEADER_SIZE {
                    return Ok((take, FeedOutcome::NeedMoreHeader));
                }

                let mut header = [0u8; HEADER_SIZE];
                header.copy_from_slice(&self.io.buf[..HEADER_SIZE]);
                let (opcode, raw_len) = parse_header(&header);
                let body_len = check_body_len(raw_len, cap)?;

                self.io.buf.clear();
                self.io.buf.resize(body_len as usize, 0);
                self.phase = Phase::ReadingBody {
                    opcode,
                    body_len,
                    filled: 0,
                };

                if body_len == 0 {
                    let body = std::mem::take(&mut self.io.buf);
                    self.reset_to_header();
                    return Ok((take, FeedOutcome::FrameComplete { opcode, body }));
                }
                Ok((take, FeedOutcome::NeedMoreBody))
            }
            Phase::ReadingBody {
                opcode,
                body_len,
                filled,
            } => {
                let opcode = *opcode;
                let need = *body_len as usize - *filled;
                let take = need.min(data.len());
                let start = *filled;
                self.io.buf[start..start + take].copy_from_slice(&data[..take]);
                *filled += take;
                if *filled < *body_len as usize {
                    return Ok((take, FeedOutcome::NeedMoreBody));
                }

                let body = std::mem::take(&mut self.io.buf);
                self.reset_to_header();
                Ok((take, FeedOutcome::FrameComplete { opcode, body }))
            }
        }
    }

    /// Reclaim this connection's scratch buffer for return to the pool.
    pub fn into_io_context(self) -> IoContext {
        self.io
    }
}

/// Registry of live connections, guarded by a single mutex (spec.md §4.3).
///
/// The id handed back by `insert` doubles as the registry key and the
/// per-connection `mio` readiness token, so the event loop never needs a
/// separate id scheme.
pub struct ConnectionRegistry {
    inner: Mutex<Slab<ConnectionState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slab::new()),
        }
    }

    pub fn insert(&self, state: ConnectionState) -> usize {
        self.inner.lock().unwrap().insert(state)
    }

    /// Remove a connection. Returns `None` if it was already removed,
    /// which is the de-duplication token the close path (spec.md §4.7)
    /// relies on to stay idempotent.
    pub fn remove(&self, id: usize) -> Option<ConnectionState> {
        self.inner.lock().unwrap().try_remove(id)
    }

    /// Run `f` against a connection's state while holding the registry
    /// lock. `f` must not perform I/O (spec.md §5: never hold the
    /// registry lock across an I/O call).
    pub fn with_mut<R>(&self, id: usize, f: impl FnOnce(&mut ConnectionState) -> R) -> Option<R> {
        let mut guard = self.inner.lock().unwrap();
        guard.get_mut(id).map(f)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Copy out `(id, fd)` pairs for every live connection. Used by the
    /// reaper so its liveness probes run outside the registry lock
    /// (spec.md §5 lock discipline).
    pub fn snapshot_fds(&self) -> Vec<(usize, RawFd)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(id, state)| (id, state.fd))
            .collect()
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
    use crate::runtime::io_context::IoContextPool;

    fn ctx() -> IoContext {
        IoContextPool::new().pop()
    }

    #[test]
    fn header_then_zero_body_completes_immediately() {
        let mut conn = ConnectionState::new(3, ctx());
        let header = crate::codec::encode_header(7, 0);
        let (consumed, outcome) = conn.feed(&header, 1024).unwrap();
        assert_eq!(consumed, 6);
        match outcome {
            FeedOutcome::FrameComplete { opcode, body } => {
                assert_eq!(opcode, 7);
                assert!(body.is_empty());
            }
            other => panic!("expected FrameComplete, got {other:?}"),
        }
        assert!(matches!(conn.phase, Phase::ReadingHeader { filled: 0 }));
    }

    #[test]
    fn header_and_body_can_be_split_byte_by_byte() {
        let mut conn = ConnectionState::new(3, ctx());
        let mut frame = crate::codec::encode_header(1, 3).to_vec();
        frame.extend_from_slice(b"abc");

        let mut last = None;
        for byte in frame {
            let (_consumed, outcome) = conn.feed(&[byte], 1024).unwrap();
            last = Some(outcome);
        }
        match last.unwrap() {
            FeedOutcome::FrameComplete { opcode, body } => {
                assert_eq!(opcode, 1);
                assert_eq!(body, b"abc");
            }
            other => panic!("expected FrameComplete, got {other:?}"),
        }
    }

    #[test]
    fn two_frames_in_one_chunk_both_complete() {
        let mut conn = ConnectionState::new(3, ctx());
        let mut data = crate::codec::encode_header(1, 2).to_vec();
        data.extend_from_slice(b"hi");
        data.extend_from_slice(&crate::codec::encode_header(2, 3));
        data.extend_from_slice(b"bye");

        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (consumed, outcome) = conn.feed(&data[offset..], 1024).unwrap();
            offset += consumed;
            if let FeedOutcome::FrameComplete { opcode, body } = outcome {
                frames.push((opcode, body));
            }
        }

        assert_eq!(frames, vec![(1, b"hi".to_vec()), (2, b"bye".to_vec())]);
    }

    #[test]
    fn oversized_body_len_is_rejected() {
        let mut conn = ConnectionState::new(3, ctx());
        let header = crate::codec::encode_header(1, 2048);
        let err = conn.feed(&header, 1024).unwrap_err();
        assert_eq!(
            err,
            FrameError::BodyTooLarge {
                len: 2048,
                cap: 1024
            }
        );
    }

    #[test]
    fn registry_insert_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let id = registry.insert(ConnectionState::new(5, ctx()));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_fds_reflects_live_connections() {
        let registry = ConnectionRegistry::new();
        let a = registry.insert(ConnectionState::new(10, ctx()));
        let b = registry.insert(ConnectionState::new(11, ctx()));
        let mut fds: Vec<RawFd> = registry.snapshot_fds().into_iter().map(|(_, fd)| fd).collect();
        fds.sort_unstable();
        assert_eq!(fds, vec![10, 11]);
        registry.remove(a);
        let remaining = registry.snapshot_fds();
        assert_eq!(remaining, vec![(b, 11)]);
    }
}
