//! Per-sub-connection send queue and I/O threads.
//!
//! Each sub-connection owns one writer thread and one reader thread.
//! The writer drains an owned-chunk FIFO, so at most one write is ever
//! in flight per TCP socket and frame bytes never interleave. The reader
//! reassembles frames and hands them to the session for dispatch.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;
use tcpsst_frame::{FrameError, FrameReader};
use tcpsst_transport::TcpConn;
use tracing::{debug, trace};

use crate::session::SstSession;

/// Outcome of waiting for the next chunk to write.
enum Popped {
    Chunk(Bytes),
    /// Queue drained after `begin_close`; half-close and exit.
    Drained,
    /// Connection failed elsewhere; exit without touching the socket.
    Failed,
}

#[derive(Default)]
struct QueueInner {
    chunks: VecDeque<Bytes>,
    closing: bool,
    failed: bool,
}

/// FIFO of encoded frames awaiting the writer thread.
pub(crate) struct SendQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    // Bytes accepted but not yet written; read lock-free on the
    // unreliable-send drop path.
    queued_bytes: AtomicUsize,
}

impl SendQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            ready: Condvar::new(),
            queued_bytes: AtomicUsize::new(0),
        })
    }

    /// Append an owned chunk. Returns false when the queue no longer
    /// accepts work (closing or failed); the chunk is released here and
    /// the caller must treat the send as dropped.
    pub(crate) fn enqueue(&self, chunk: Bytes) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closing || inner.failed {
            return false;
        }
        self.queued_bytes.fetch_add(chunk.len(), Ordering::Relaxed);
        inner.chunks.push_back(chunk);
        drop(inner);
        self.ready.notify_one();
        true
    }

    /// Bytes accepted and not yet written to the socket.
    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed)
    }

    /// Stop accepting work; the writer drains what is queued, then
    /// half-closes the socket.
    pub(crate) fn begin_close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closing = true;
        drop(inner);
        self.ready.notify_one();
    }

    /// Drop all queued work and release the writer immediately.
    pub(crate) fn fail(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.failed = true;
        inner.chunks.clear();
        drop(inner);
        self.queued_bytes.store(0, Ordering::Relaxed);
        self.ready.notify_one();
    }

    fn pop_blocking(&self) -> Popped {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if inner.failed {
                return Popped::Failed;
            }
            if let Some(chunk) = inner.chunks.pop_front() {
                return Popped::Chunk(chunk);
            }
            if inner.closing {
                return Popped::Drained;
            }
            inner = self
                .ready
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Writer thread body: one outstanding write at a time, FIFO order.
pub(crate) fn run_writer(
    session: Arc<SstSession>,
    index: usize,
    mut conn: TcpConn,
    queue: Arc<SendQueue>,
) {
    loop {
        match queue.pop_blocking() {
            Popped::Chunk(chunk) => {
                let len = chunk.len();
                if let Err(err) = conn.write_all(&chunk) {
                    debug!(conn = index, %err, "sub-connection write failed");
                    queue.fail();
                    session.sub_connection_failed(index, &err.to_string());
                    return;
                }
                queue.queued_bytes.fetch_sub(len, Ordering::Relaxed);
                trace!(conn = index, len, "chunk written");
            }
            Popped::Drained => {
                let _ = conn.flush();
                let _ = conn.shutdown_write();
                trace!(conn = index, "writer drained, half-closed");
                return;
            }
            Popped::Failed => return,
        }
    }
}

/// Reader thread body: reassemble frames and dispatch until the
/// connection ends.
pub(crate) fn run_reader(session: Arc<SstSession>, index: usize, conn: TcpConn) {
    let mut reader = FrameReader::new(conn);
    loop {
        match reader.read_frame() {
            Ok(frame) => {
                if let Err(err) = session.dispatch_frame(index, frame) {
                    session.protocol_failure(&err);
                    return;
                }
            }
            Err(FrameError::ConnectionClosed) => {
                trace!(conn = index, "sub-connection closed by peer");
                session.sub_connection_failed(index, "closed by peer");
                return;
            }
            Err(FrameError::Io(err)) => {
                debug!(conn = index, %err, "sub-connection read failed");
                session.sub_connection_failed(index, &err.to_string());
                return;
            }
            Err(err) => {
                // Malformed frame bytes: a protocol violation.
                session.protocol_failure(&err.into());
                return;
            }
        }
    }
}
