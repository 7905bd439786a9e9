//! Frame codec for the TCPSST multiplexed stream transport.
//!
//! Every frame on a sub-connection is a variable-length packet-length
//! prefix (30-bit range, 1-5 bytes), a variable-length stream id
//! (1-9 bytes), and the payload. Both prefixes use the same varint
//! scheme: 7 bits of magnitude per byte, little-endian, low bit as the
//! continuation flag.
//!
//! No partial reads leak upward: [`FrameReader`] reassembles and hands
//! callers complete frames only.

pub mod codec;
pub mod error;
pub mod reader;
pub mod varint;

pub use codec::{decode_frame, encode_frame, encoded_frame, encoded_frame_len, Frame};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use varint::{
    StreamId, MAX_PACKET_LENGTH, MAX_STREAM_ID, PACKET_LENGTH_MAX_LEN, STREAM_ID_MAX_LEN,
};
