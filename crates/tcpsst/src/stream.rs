use std::sync::Arc;

use tcpsst_frame::{encoded_frame, StreamId};
use tracing::debug;

use crate::callbacks::StreamCallbacks;
use crate::error::{Result, SstError};
use crate::send_status::SendStatus;
use crate::session::{RawRequest, SstSession};

/// Delivery guarantees for one send. Ordered-unreliable does not exist;
/// ordering is only meaningful when every frame arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// May be dropped by the sender under backpressure; arrives intact if
    /// sent at all.
    Unreliable,
    /// Delivered, in send order relative to other ordered sends on the
    /// same stream.
    ReliableOrdered,
    /// Delivered, in whatever order the sub-connections produce.
    ReliableUnordered,
}

impl Reliability {
    /// Map `(ordered, reliable)` flags onto a reliability level,
    /// rejecting the ordered-unreliable combination.
    pub fn from_flags(ordered: bool, reliable: bool) -> Result<Self> {
        match (ordered, reliable) {
            (true, true) => Ok(Reliability::ReliableOrdered),
            (false, true) => Ok(Reliability::ReliableUnordered),
            (false, false) => Ok(Reliability::Unreliable),
            (true, false) => Err(SstError::IllegalReliability),
        }
    }

    fn flags(self) -> (bool, bool) {
        match self {
            Reliability::ReliableOrdered => (false, false),
            Reliability::ReliableUnordered => (true, false),
            Reliability::Unreliable => (true, true),
        }
    }
}

/// User-facing handle to one logical stream.
///
/// Cloning shares the stream; the id stays owned by the session until the
/// close handshake finishes, and is never reused.
#[derive(Clone)]
pub struct SstStream {
    session: Arc<SstSession>,
    id: StreamId,
    send_status: Arc<SendStatus>,
}

impl SstStream {
    pub(crate) fn new(session: Arc<SstSession>, id: StreamId, send_status: Arc<SendStatus>) -> Self {
        Self {
            session,
            id,
            send_status,
        }
    }

    /// This stream's id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The session carrying this stream.
    pub fn session(&self) -> &Arc<SstSession> {
        &self.session
    }

    /// Send `data` with the given guarantees.
    ///
    /// Fire-and-forget: transport trouble is reported via
    /// `on_disconnected`, never here. A send racing a close of this
    /// stream is dropped silently. The errors that do surface are caller
    /// mistakes (`PayloadTooLarge`) or a session already torn down
    /// (`NotConnected`).
    pub fn send(&self, data: &[u8], reliability: Reliability) -> Result<()> {
        let (unordered, unreliable) = reliability.flags();
        let chunk = encoded_frame(self.id, data)?;

        if !self.send_status.try_begin_send() {
            debug!(stream = %self.id, "send to closed stream");
            return Ok(());
        }
        let result = self.session.send_bytes(RawRequest {
            origin: self.id,
            unordered,
            unreliable,
            data: chunk,
        });
        self.send_status.end_send();
        result
    }

    /// Close this stream: block further sends, wait out in-flight ones,
    /// stop inbound delivery, and tell the peer.
    pub fn close(&self) {
        self.send_status.begin_close();
        self.session.close_stream_local(self.id);
    }

    /// Open a sibling stream on the session carrying `other`.
    ///
    /// Fails with `NotConnected` when that session is gone or not yet
    /// connected.
    pub fn clone_from(other: &SstStream, callbacks: StreamCallbacks) -> Result<SstStream> {
        other.session.open_stream(callbacks)
    }
}

impl std::fmt::Debug for SstStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstStream")
            .field("id", &self.id)
            .field("session", &self.session.state())
            .finish()
    }
}
