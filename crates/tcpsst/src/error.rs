use tcpsst_frame::FrameError;
use tcpsst_transport::TransportError;

/// Errors surfaced at the transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum SstError {
    /// Opening the sub-connection pool to the peer failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer did not complete the session handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer closed the connection mid-exchange.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The peer sent bytes the protocol does not allow. Receiving one of
    /// these tears down the whole multiplexed socket.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The local stream-id counter wrapped its 63-bit space.
    #[error("stream id space exhausted")]
    StreamIdExhausted,

    /// The multiplexed socket is not in the `Connected` state.
    #[error("socket is not connected")]
    NotConnected,

    /// Ordered-unreliable delivery was requested; only the other three
    /// reliability combinations exist.
    #[error("ordered-unreliable delivery is not supported")]
    IllegalReliability,

    /// Frame codec error (includes `PayloadTooLarge`).
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// TCP-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, SstError>;
