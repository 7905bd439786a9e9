use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_frame, Frame};
use crate::error::{FrameError, Result};
use crate::varint::MAX_PACKET_LENGTH;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Owns the per-connection reassembly buffer: partial reads accumulate
/// here and callers only ever see whole frames. Reassembly is strictly
/// per-socket; one reader per TCP connection, never shared.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    max_frame_len: u64,
}

impl<T: Read> FrameReader<T> {
    /// Create a frame reader accepting frames up to the protocol maximum.
    pub fn new(inner: T) -> Self {
        Self::with_max_frame_len(inner, MAX_PACKET_LENGTH)
    }

    /// Create a frame reader with an explicit frame-length ceiling.
    pub fn with_max_frame_len(inner: T, max_frame_len: u64) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_frame_len,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.max_frame_len)? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;
    use crate::codec::encode_frame;
    use crate::varint::StreamId;

    fn sid(raw: u64) -> StreamId {
        StreamId::new(raw).unwrap()
    }

    #[test]
    fn read_single_frame() {
        let mut wire = BytesMut::new();
        encode_frame(sid(1), b"hello", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.stream, sid(1));
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn read_multiple_frames() {
        let mut wire = BytesMut::new();
        encode_frame(sid(1), b"one", &mut wire).unwrap();
        encode_frame(sid(3), b"two", &mut wire).unwrap();
        encode_frame(sid(5), b"three", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!((f1.stream, f1.payload.as_ref()), (sid(1), b"one".as_ref()));
        assert_eq!((f2.stream, f2.payload.as_ref()), (sid(3), b"two".as_ref()));
        assert_eq!((f3.stream, f3.payload.as_ref()), (sid(5), b"three".as_ref()));
    }

    #[test]
    fn byte_by_byte_reassembly() {
        let mut wire = BytesMut::new();
        encode_frame(sid(4), b"slow", &mut wire).unwrap();

        let mut reader = FrameReader::new(ByteByByteReader {
            bytes: wire.to_vec(),
            pos: 0,
        });

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.stream, sid(4));
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut wire = BytesMut::new();
        encode_frame(sid(2), b"truncated", &mut wire).unwrap();
        wire.truncate(wire.len() - 3);

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let mut wire = BytesMut::new();
        encode_frame(sid(1), &[0u8; 256], &mut wire).unwrap();

        let mut reader = FrameReader::with_max_frame_len(Cursor::new(wire.to_vec()), 64);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::BadLength));
    }

    #[test]
    fn interrupted_read_retries() {
        let mut wire = BytesMut::new();
        encode_frame(sid(8), b"ok", &mut wire).unwrap();

        let mut reader = FrameReader::new(InterruptedThenData {
            interrupted: false,
            bytes: wire.to_vec(),
            pos: 0,
        });
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.stream, sid(8));
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn accessors_and_into_inner() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
