//! Control frames travel in-band on stream id 0.
//!
//! Body layout: `opcode:u8` followed by one stream-id varint. `NEW_STREAM`
//! may carry additional bytes, delivered as the new stream's first
//! payload.

use bytes::{BufMut, Bytes, BytesMut};
use tcpsst_frame::varint::{Decoded, StreamId, STREAM_ID_MAX_LEN};

use crate::error::{Result, SstError};

pub(crate) const OP_NEW_STREAM: u8 = 1;
pub(crate) const OP_CLOSE_STREAM: u8 = 2;
pub(crate) const OP_ACK_CLOSE: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlFrame {
    /// Peer opened `stream`; `initial` is its first payload (may be empty).
    NewStream { stream: StreamId, initial: Bytes },
    /// Peer will send no more bytes on `stream`.
    CloseStream(StreamId),
    /// Peer acknowledges our close; the id can be retired.
    AckClose(StreamId),
}

/// Encode a control body for `opcode` about `stream`.
pub(crate) fn encode(opcode: u8, stream: StreamId) -> Bytes {
    let mut sid_bytes = [0u8; STREAM_ID_MAX_LEN];
    let sid_len = stream.serialize(&mut sid_bytes);
    let mut body = BytesMut::with_capacity(1 + sid_len);
    body.put_u8(opcode);
    body.put_slice(&sid_bytes[..sid_len]);
    body.freeze()
}

/// Decode a control body. Unknown opcodes, malformed ids, the reserved
/// id 0, and trailing bytes on close/ack are all protocol violations.
pub(crate) fn decode(body: &Bytes) -> Result<ControlFrame> {
    let Some((&opcode, rest)) = body.split_first() else {
        return Err(SstError::ProtocolViolation("empty control frame".into()));
    };

    let (raw, sid_len) = match StreamId::decode(rest) {
        Ok(Decoded::Value(raw, len)) => (raw, len),
        Ok(Decoded::NeedMore) | Err(_) => {
            return Err(SstError::ProtocolViolation(
                "malformed control stream id".into(),
            ))
        }
    };
    let stream = StreamId::new(raw)
        .map_err(|_| SstError::ProtocolViolation("control stream id out of range".into()))?;
    if stream.is_control() {
        return Err(SstError::ProtocolViolation(
            "control op on reserved stream id 0".into(),
        ));
    }

    let tail = &rest[sid_len..];
    match opcode {
        OP_NEW_STREAM => Ok(ControlFrame::NewStream {
            stream,
            initial: body.slice(1 + sid_len..),
        }),
        OP_CLOSE_STREAM | OP_ACK_CLOSE if !tail.is_empty() => Err(SstError::ProtocolViolation(
            format!("trailing bytes after control op {opcode}"),
        )),
        OP_CLOSE_STREAM => Ok(ControlFrame::CloseStream(stream)),
        OP_ACK_CLOSE => Ok(ControlFrame::AckClose(stream)),
        other => Err(SstError::ProtocolViolation(format!(
            "unknown control opcode {other}"
        ))),
    }
}
