use std::sync::{Arc, Mutex};

use crate::send_status::SendStatus;
use crate::stream::SstStream;

/// Connection lifecycle events delivered to a stream's connection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The session reached `Connected` (or the stream registered on an
    /// already-connected session).
    Connected,
    /// The session never reached `Connected`.
    ConnectFailed,
    /// The stream is gone: closed locally, closed by the peer, or torn
    /// down with the session.
    Disconnected,
}

/// Invoked on session/stream lifecycle transitions; `reason` is
/// human-readable context for logs.
pub type ConnectionCallback = Box<dyn FnMut(ConnectionStatus, &str) + Send>;

/// Invoked with each frame payload delivered to a stream.
pub type BytesCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Invoked when the peer opens a new logical stream. Return the callbacks
/// to install, or `None` to refuse delivery (the peer's frames for that
/// stream are then dropped).
pub type SubstreamCallback = Box<dyn FnMut(SstStream) -> Option<StreamCallbacks> + Send>;

/// User-supplied callbacks for one logical stream.
#[derive(Default)]
pub struct StreamCallbacks {
    pub connection: Option<ConnectionCallback>,
    pub bytes: Option<BytesCallback>,
}

impl StreamCallbacks {
    /// Callbacks observing payload bytes only.
    pub fn on_bytes(f: impl FnMut(&[u8]) + Send + 'static) -> Self {
        Self {
            connection: None,
            bytes: Some(Box::new(f)),
        }
    }

    /// Attach a connection-event observer.
    pub fn with_connection(
        mut self,
        f: impl FnMut(ConnectionStatus, &str) + Send + 'static,
    ) -> Self {
        self.connection = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("connection", &self.connection.is_some())
            .field("bytes", &self.bytes.is_some())
            .finish()
    }
}

/// Installed callback state for one live stream id.
///
/// Callbacks fire on reader threads. The inner mutex serializes
/// invocation per stream; the session's stream-table lock is never held
/// across user code.
pub(crate) struct CallbackSet {
    inner: Mutex<StreamCallbacks>,
    send_status: Arc<SendStatus>,
}

impl CallbackSet {
    pub(crate) fn new(callbacks: StreamCallbacks, send_status: Arc<SendStatus>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(callbacks),
            send_status,
        })
    }

    pub(crate) fn send_status(&self) -> &Arc<SendStatus> {
        &self.send_status
    }

    /// Fill an empty set while holding the delivery lock, so frames
    /// arriving on other sub-connections wait rather than fall through a
    /// not-yet-installed callback. Returns false when `f` declines.
    pub(crate) fn initialize_with<F>(&self, f: F) -> bool
    where
        F: FnOnce() -> Option<StreamCallbacks>,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match f() {
            Some(callbacks) => {
                *inner = callbacks;
                true
            }
            None => false,
        }
    }

    pub(crate) fn deliver_bytes(&self, payload: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = inner.bytes.as_mut() {
            callback(payload);
        }
    }

    pub(crate) fn deliver_connection(&self, status: ConnectionStatus, reason: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = inner.connection.as_mut() {
            callback(status, reason);
        }
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet").finish_non_exhaustive()
    }
}
