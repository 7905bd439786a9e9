/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length prefix did not terminate within 5 bytes, or declared a
    /// length outside the 30-bit range.
    #[error("malformed frame length prefix")]
    BadLength,

    /// The stream id did not terminate within 9 bytes or overran its frame.
    #[error("malformed stream id")]
    BadStreamId,

    /// Stream id plus payload exceed what a 30-bit length can describe.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
