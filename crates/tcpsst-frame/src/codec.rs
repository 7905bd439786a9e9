use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::varint::{self, Decoded, StreamId, MAX_PACKET_LENGTH, PACKET_LENGTH_MAX_LEN};

/// A decoded frame: origin stream plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The logical stream this frame belongs to.
    pub stream: StreamId,
    /// The frame body (stream-id prefix already stripped).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(stream: StreamId, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            payload: payload.into(),
        }
    }
}

/// Total wire size of a frame carrying `payload_len` bytes on `stream`.
///
/// Fails with `PayloadTooLarge` when stream id plus payload cannot be
/// described by a 30-bit length prefix. This check is pure arithmetic, so
/// callers can validate a size without materializing the payload.
pub fn encoded_frame_len(stream: StreamId, payload_len: usize) -> Result<usize> {
    let sid_len = stream.serialized_len();
    let total = payload_len as u64 + sid_len as u64;
    if total > MAX_PACKET_LENGTH {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: (MAX_PACKET_LENGTH as usize) - sid_len,
        });
    }
    Ok(varint::encoded_len(total) + total as usize)
}

/// Encode a frame into `dst`.
///
/// Wire format:
/// ```text
/// ┌────────────────┬───────────────────┬─────────────────────────┐
/// │ length (1-5B)  │ stream id (1-9B)  │ payload                 │
/// │ varint; covers │ varint            │ (length - |id| bytes)   │
/// │ id + payload   │                   │                         │
/// └────────────────┴───────────────────┴─────────────────────────┘
/// ```
pub fn encode_frame(stream: StreamId, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let wire_len = encoded_frame_len(stream, payload.len())?;

    let mut sid_bytes = [0u8; varint::STREAM_ID_MAX_LEN];
    let sid_len = stream.serialize(&mut sid_bytes);
    let mut len_bytes = [0u8; PACKET_LENGTH_MAX_LEN];
    let len_len = varint::encode((payload.len() + sid_len) as u64, &mut len_bytes);

    dst.reserve(wire_len);
    dst.put_slice(&len_bytes[..len_len]);
    dst.put_slice(&sid_bytes[..sid_len]);
    dst.put_slice(payload);
    Ok(())
}

/// Encode a frame as one contiguous buffer.
///
/// The socket writer issues a single write per frame, so the length
/// prefix, stream id, and payload must share an allocation.
pub fn encoded_frame(stream: StreamId, payload: &[u8]) -> Result<Bytes> {
    let wire_len = encoded_frame_len(stream, payload.len())?;
    let mut buf = BytesMut::with_capacity(wire_len);
    encode_frame(stream, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode one frame from the front of `src`, consuming its bytes.
///
/// Returns `Ok(None)` until a complete frame is buffered. Parsing is
/// two-phase: first the length prefix (at most 5 bytes, else `BadLength`),
/// then `total` body bytes, from which the stream id is split off.
/// `max_frame_len` bounds the declared body length; a peer claiming more
/// is treated as malformed rather than buffered.
pub fn decode_frame(src: &mut BytesMut, max_frame_len: u64) -> Result<Option<Frame>> {
    let (total, header_len) = match varint::decode(src, PACKET_LENGTH_MAX_LEN)? {
        Decoded::NeedMore => return Ok(None),
        Decoded::Value(total, header_len) => (total, header_len),
    };
    if total == 0 || total > MAX_PACKET_LENGTH || total > max_frame_len {
        return Err(FrameError::BadLength);
    }

    let total = total as usize;
    if src.len() < header_len + total {
        return Ok(None);
    }

    src.advance(header_len);
    let mut body = src.split_to(total);

    let (sid_raw, sid_len) = match StreamId::decode(&body)? {
        // The id must terminate inside the body it prefixes.
        Decoded::NeedMore => return Err(FrameError::BadStreamId),
        Decoded::Value(raw, len) => (raw, len),
    };
    let stream = StreamId::new(sid_raw)?;
    body.advance(sid_len);

    Ok(Some(Frame {
        stream,
        payload: body.freeze(),
    }))
}
