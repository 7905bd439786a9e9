//! The multiplexed socket: N TCP sub-connections to one peer, a stream
//! table, and in-band control on stream id 0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tcpsst_frame::{encoded_frame, Frame, StreamId, MAX_STREAM_ID};
use tcpsst_transport::TcpConn;
use tracing::{debug, info, trace, warn};

use crate::callbacks::{CallbackSet, ConnectionStatus, StreamCallbacks, SubstreamCallback};
use crate::config::SessionConfig;
use crate::connection::{run_reader, run_writer, SendQueue};
use crate::control::{self, ControlFrame, OP_ACK_CLOSE, OP_CLOSE_STREAM, OP_NEW_STREAM};
use crate::driver::Driver;
use crate::error::{Result, SstError};
use crate::send_status::SendStatus;
use crate::stream::SstStream;

/// Which end of the session this is. Determines stream-id parity so both
/// sides can allocate without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Dialed the sub-connections; allocates odd ids.
    Initiator,
    /// Accepted them; allocates even ids.
    Acceptor,
}

impl Side {
    fn first_id(self) -> u64 {
        match self {
            Side::Initiator => 1,
            Side::Acceptor => 2,
        }
    }

    /// Parity (id mod 2) the peer's allocations must carry.
    fn peer_parity(self) -> u64 {
        match self {
            Side::Initiator => 0,
            Side::Acceptor => 1,
        }
    }
}

/// Session lifecycle. Transitions only move rightward; `Disconnected` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Connected,
    Draining,
    Disconnected,
}

/// One send, already encoded, with its routing flags.
pub(crate) struct RawRequest {
    pub origin: StreamId,
    pub unordered: bool,
    pub unreliable: bool,
    /// The complete encoded frame (length prefix, id, payload).
    pub data: Bytes,
}

struct SubConn {
    queue: Arc<SendQueue>,
    conn: TcpConn,
}

/// A multiplexed socket: one per peer pair, shared between user handles
/// and the reader/writer threads. The last holder releases it.
pub struct SstSession {
    config: SessionConfig,
    side: Side,
    nonce: u64,
    driver: Arc<Driver>,
    state: Mutex<SessionState>,
    state_cv: Condvar,
    conns: OnceLock<Vec<SubConn>>,
    round_robin: AtomicUsize,
    streams: Mutex<HashMap<u64, Arc<CallbackSet>>>,
    next_stream_id: AtomicU64,
    /// First stream registered before `Connected`; receives the session's
    /// connected / connect-failed event exactly once.
    session_notify: Mutex<Option<Arc<CallbackSet>>>,
    /// Sends issued before the handshake finished, flushed in order on
    /// success.
    preconnect: Mutex<Vec<RawRequest>>,
    /// Locally-closed ids awaiting the peer's ACK_CLOSE, with the
    /// deadline after which they are retired unconditionally.
    closing: Mutex<HashMap<u64, Instant>>,
    substream: Mutex<Option<SubstreamCallback>>,
}

impl SstSession {
    pub(crate) fn new(
        config: SessionConfig,
        side: Side,
        nonce: u64,
        driver: Arc<Driver>,
        substream: Option<SubstreamCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            side,
            nonce,
            driver,
            state: Mutex::new(SessionState::Unconnected),
            state_cv: Condvar::new(),
            conns: OnceLock::new(),
            round_robin: AtomicUsize::new(0),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(side.first_id()),
            session_notify: Mutex::new(None),
            preconnect: Mutex::new(Vec::new()),
            closing: Mutex::new(HashMap::new()),
            substream: Mutex::new(substream),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Which side of the session this is.
    pub fn side(&self) -> Side {
        self.side
    }

    /// The negotiated multiplex width.
    pub fn width(&self) -> u8 {
        self.config.width
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Block until the session reaches `Connected` (true) or terminates /
    /// times out (false). A session already draining counts as connected,
    /// since it got there once.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match *state {
                SessionState::Connected | SessionState::Draining => return true,
                SessionState::Disconnected => return false,
                SessionState::Unconnected | SessionState::Connecting => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .state_cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    pub(crate) fn set_state_connecting(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == SessionState::Unconnected {
            *state = SessionState::Connecting;
            self.state_cv.notify_all();
        }
    }

    /// Allocate the next local stream id (step 2, parity fixed per side).
    pub(crate) fn new_id(&self) -> Result<StreamId> {
        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        if id > MAX_STREAM_ID {
            return Err(SstError::StreamIdExhausted);
        }
        StreamId::new(id).map_err(|_| SstError::StreamIdExhausted)
    }

    /// Open a new locally-allocated stream on a connected session.
    pub fn open_stream(self: &Arc<Self>, callbacks: StreamCallbacks) -> Result<SstStream> {
        if self.state() != SessionState::Connected {
            return Err(SstError::NotConnected);
        }
        let id = self.new_id()?;
        let send_status = Arc::new(SendStatus::new());
        self.install(id, callbacks, Arc::clone(&send_status))?;
        self.broadcast_control(OP_NEW_STREAM, id);
        Ok(SstStream::new(Arc::clone(self), id, send_status))
    }

    /// Register the initiator's first stream while the session is still
    /// handshaking.
    pub(crate) fn register_first_stream(
        self: &Arc<Self>,
        callbacks: StreamCallbacks,
    ) -> Result<SstStream> {
        let id = self.new_id()?;
        let send_status = Arc::new(SendStatus::new());
        self.install(id, callbacks, Arc::clone(&send_status))?;
        Ok(SstStream::new(Arc::clone(self), id, send_status))
    }

    /// Install a callback set for `id`. Streams registered after
    /// `Connected` get a synthetic connected event immediately; the first
    /// registrant before that point becomes the session notifier.
    fn install(
        &self,
        id: StreamId,
        callbacks: StreamCallbacks,
        send_status: Arc<SendStatus>,
    ) -> Result<()> {
        let set = CallbackSet::new(callbacks, send_status);
        let connected_now = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                SessionState::Draining | SessionState::Disconnected => {
                    return Err(SstError::NotConnected)
                }
                SessionState::Unconnected | SessionState::Connecting => {
                    let mut notify = self.session_notify.lock().unwrap_or_else(|e| e.into_inner());
                    if notify.is_none() {
                        *notify = Some(Arc::clone(&set));
                    }
                }
                SessionState::Connected => {}
            }
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.insert(id.value(), Arc::clone(&set));
            matches!(*state, SessionState::Connected)
        };
        if connected_now {
            set.deliver_connection(ConnectionStatus::Connected, "session connected");
        }
        Ok(())
    }

    /// Wire up the handshaken sub-connections and go `Connected`.
    pub(crate) fn finish_connect(self: &Arc<Self>, tcp_conns: Vec<TcpConn>) -> Result<()> {
        let mut subs = Vec::with_capacity(tcp_conns.len());
        let mut halves = Vec::with_capacity(tcp_conns.len());
        for conn in tcp_conns {
            let reader_conn = conn.try_clone()?;
            let writer_conn = conn.try_clone()?;
            let queue = SendQueue::new();
            halves.push((reader_conn, writer_conn, Arc::clone(&queue)));
            subs.push(SubConn { queue, conn });
        }
        self.conns
            .set(subs)
            .map_err(|_| SstError::ConnectionFailed("session already wired".into()))?;

        // Everything below the state lock preserves send order: announce
        // locally-registered streams, flush pre-connect sends behind those
        // announcements, and only then let concurrent senders through by
        // flipping to Connected.
        let notify = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

            let ids: Vec<u64> = {
                let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
                streams.keys().copied().collect()
            };
            for id in ids {
                if let Ok(id) = StreamId::new(id) {
                    self.broadcast_control(OP_NEW_STREAM, id);
                }
            }

            let queued: Vec<RawRequest> = {
                let mut preconnect = self.preconnect.lock().unwrap_or_else(|e| e.into_inner());
                preconnect.drain(..).collect()
            };
            for request in queued {
                if let Err(err) = self.route(request) {
                    debug!(%err, "queued pre-connect send dropped");
                }
            }

            *state = SessionState::Connected;
            self.state_cv.notify_all();
            self.session_notify
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        };

        for (index, (reader_conn, writer_conn, queue)) in halves.into_iter().enumerate() {
            let session = Arc::clone(self);
            self.driver
                .spawn(&format!("conn{index}-rd"), move || {
                    run_reader(session, index, reader_conn)
                })
                .map_err(|e| SstError::Transport(e.into()))?;
            let session = Arc::clone(self);
            self.driver
                .spawn(&format!("conn{index}-wr"), move || {
                    run_writer(session, index, writer_conn, queue)
                })
                .map_err(|e| SstError::Transport(e.into()))?;
        }

        info!(
            nonce = self.nonce,
            width = self.config.width,
            side = ?self.side,
            "session connected"
        );
        if let Some(set) = notify {
            set.deliver_connection(ConnectionStatus::Connected, "session connected");
        }
        Ok(())
    }

    /// Handshake failed: tear down and report `on_connected(false)` to the
    /// first registered stream.
    pub(crate) fn fail_connect(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, SessionState::Disconnected) {
                return;
            }
            *state = SessionState::Disconnected;
            self.state_cv.notify_all();
        }
        warn!(reason, "session connect failed");
        self.preconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let notify = self
            .session_notify
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(set) = notify {
            set.deliver_connection(ConnectionStatus::ConnectFailed, reason);
        }
    }

    /// Route one send onto a sub-connection.
    ///
    /// Ordered requests pin to the connection hashed from their origin
    /// stream; unordered requests round-robin; unreliable requests are
    /// dropped outright when the chosen queue is past the high-water mark.
    pub(crate) fn send_bytes(&self, request: RawRequest) -> Result<()> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                SessionState::Unconnected | SessionState::Connecting => {
                    self.preconnect
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(request);
                    return Ok(());
                }
                SessionState::Connected => {}
                SessionState::Draining | SessionState::Disconnected => {
                    return Err(SstError::NotConnected)
                }
            }
        }
        self.route(request)
    }

    fn route(&self, request: RawRequest) -> Result<()> {
        let Some(conns) = self.conns.get() else {
            return Err(SstError::NotConnected);
        };
        let width = conns.len();
        let index = if request.unordered {
            self.round_robin.fetch_add(1, Ordering::Relaxed) % width
        } else {
            (request.origin.value() % width as u64) as usize
        };
        let queue = &conns[index].queue;

        if request.unreliable && queue.queued_bytes() > self.config.high_water_mark {
            debug!(
                stream = %request.origin,
                conn = index,
                "unreliable send dropped past high-water mark"
            );
            return Ok(());
        }
        if !queue.enqueue(request.data) {
            debug!(
                stream = %request.origin,
                conn = index,
                "send dropped: sub-connection no longer accepts work"
            );
        }
        Ok(())
    }

    /// Deliver one decoded frame. An error return is a protocol violation
    /// that tears the whole session down.
    pub(crate) fn dispatch_frame(self: &Arc<Self>, index: usize, frame: Frame) -> Result<()> {
        self.sweep_expired_closes();
        if frame.stream.is_control() {
            let decoded = control::decode(&frame.payload)?;
            return self.handle_control(index, decoded);
        }

        let set = {
            let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.get(&frame.stream.value()).cloned()
        };
        match set {
            Some(set) => set.deliver_bytes(&frame.payload),
            None => trace!(stream = %frame.stream, "frame for unknown stream dropped"),
        }
        Ok(())
    }

    fn handle_control(self: &Arc<Self>, index: usize, frame: ControlFrame) -> Result<()> {
        match frame {
            ControlFrame::NewStream { stream, initial } => self.handle_new_stream(stream, initial),
            ControlFrame::CloseStream(stream) => {
                let retired = self.retire_stream(stream.value(), "closed by peer");
                if !retired {
                    // Unknown or already retired: tolerate late close.
                    trace!(stream = %stream, "close for unknown stream ignored");
                }
                // Always acknowledge so the peer's close handshake
                // converges, duplicates included.
                self.enqueue_control_on(index, OP_ACK_CLOSE, stream);
                Ok(())
            }
            ControlFrame::AckClose(stream) => {
                let mut closing = self.closing.lock().unwrap_or_else(|e| e.into_inner());
                if closing.remove(&stream.value()).is_some() {
                    trace!(stream = %stream, "close acknowledged");
                }
                Ok(())
            }
        }
    }

    fn handle_new_stream(self: &Arc<Self>, stream: StreamId, initial: Bytes) -> Result<()> {
        if stream.value() % 2 != self.side.peer_parity() {
            return Err(SstError::ProtocolViolation(format!(
                "peer opened stream {stream} with local parity"
            )));
        }

        let send_status = Arc::new(SendStatus::new());
        let set = CallbackSet::new(StreamCallbacks::default(), Arc::clone(&send_status));
        {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            if streams.contains_key(&stream.value()) {
                // NEW_STREAM is broadcast on every sub-connection; later
                // copies are no-ops.
                return Ok(());
            }
            streams.insert(stream.value(), Arc::clone(&set));
        }

        let handle = SstStream::new(Arc::clone(self), stream, send_status);
        let installed = set.initialize_with(|| {
            let mut substream = self.substream.lock().unwrap_or_else(|e| e.into_inner());
            substream.as_mut().and_then(|callback| callback(handle))
        });

        if installed {
            debug!(stream = %stream, "peer opened stream");
            set.deliver_connection(ConnectionStatus::Connected, "stream opened by peer");
            if !initial.is_empty() {
                set.deliver_bytes(&initial);
            }
        } else {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.remove(&stream.value());
            debug!(stream = %stream, "substream refused; frames will drop");
        }
        Ok(())
    }

    /// Remove `id` from the table and fire its disconnect exactly once.
    /// Whoever takes the entry delivers the event.
    fn retire_stream(&self, id: u64, reason: &str) -> bool {
        let taken = {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.remove(&id)
        };
        match taken {
            Some(set) => {
                set.send_status().begin_close();
                set.deliver_connection(ConnectionStatus::Disconnected, reason);
                trace!(stream = id, reason, "stream retired");
                true
            }
            None => false,
        }
    }

    /// Local close: retire the stream, tell the peer on every
    /// sub-connection, and start the ACK_CLOSE timer.
    pub(crate) fn close_stream_local(&self, id: StreamId) {
        let retired = self.retire_stream(id.value(), "locally closed");
        if self.state() == SessionState::Connected {
            self.broadcast_control(OP_CLOSE_STREAM, id);
            let deadline = Instant::now() + self.config.close_ack_timeout;
            self.closing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.value(), deadline);
        }
        if !retired {
            trace!(stream = %id, "close of already-retired stream");
        }
    }

    /// Application-requested teardown of the whole session.
    pub fn shutdown(&self) {
        self.drain("shutdown requested");
    }

    pub(crate) fn sub_connection_failed(&self, index: usize, reason: &str) {
        debug!(conn = index, reason, "sub-connection lost");
        self.drain(reason);
    }

    pub(crate) fn protocol_failure(&self, err: &SstError) {
        warn!(%err, "protocol violation; tearing session down");
        self.drain(&err.to_string());
    }

    /// `Connected -> Draining -> Disconnected`: flush outbound queues,
    /// deliver one disconnect per live stream, clear everything.
    fn drain(&self, reason: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != SessionState::Connected {
                return;
            }
            *state = SessionState::Draining;
            self.state_cv.notify_all();
        }
        info!(reason, "session draining");

        if let Some(conns) = self.conns.get() {
            for sub in conns {
                sub.queue.begin_close();
            }
            // Unblock reader threads; writers finish their drain on their
            // own clock.
            for sub in conns {
                let _ = sub.conn.shutdown_read();
            }
        }

        let taken: Vec<(u64, Arc<CallbackSet>)> = {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.drain().collect()
        };
        for (id, set) in taken {
            set.send_status().begin_close();
            set.deliver_connection(ConnectionStatus::Disconnected, reason);
            trace!(stream = id, "stream disconnected");
        }

        self.closing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.preconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = SessionState::Disconnected;
            self.state_cv.notify_all();
        }
        info!("session disconnected");
    }

    /// Send a control frame about `id` on every sub-connection, so on any
    /// one of them it orders correctly against that stream's data.
    fn broadcast_control(&self, opcode: u8, id: StreamId) {
        let Some(conns) = self.conns.get() else {
            return;
        };
        let body = control::encode(opcode, id);
        match encoded_frame(StreamId::CONTROL, &body) {
            Ok(chunk) => {
                for sub in conns {
                    sub.queue.enqueue(chunk.clone());
                }
            }
            Err(err) => debug!(%err, "control frame encode failed"),
        }
    }

    fn enqueue_control_on(&self, index: usize, opcode: u8, id: StreamId) {
        let Some(conns) = self.conns.get() else {
            return;
        };
        let body = control::encode(opcode, id);
        if let Ok(chunk) = encoded_frame(StreamId::CONTROL, &body) {
            conns[index].queue.enqueue(chunk);
        }
    }

    /// Retire locally-closed ids whose ACK never came.
    fn sweep_expired_closes(&self) {
        let mut closing = self.closing.lock().unwrap_or_else(|e| e.into_inner());
        if closing.is_empty() {
            return;
        }
        let now = Instant::now();
        closing.retain(|id, deadline| {
            if *deadline <= now {
                debug!(stream = id, "close ack timed out; retired unconditionally");
                false
            } else {
                true
            }
        });
    }
}

impl std::fmt::Debug for SstSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstSession")
            .field("side", &self.side)
            .field("width", &self.config.width)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
