//! Session handshake.
//!
//! The first sub-connection opens with a hello:
//! `"SST"` · version:u8 · width:u8 · nonce:u64-LE. Each later
//! sub-connection sends only the nonce, which associates it with the
//! pending session. The acceptor answers every sub-connection with a
//! confirm: `"SST"` · version:u8 · width:u8.
//!
//! The acceptor tells a hello from a join by the leading magic, so
//! initiators never mint a nonce whose low three little-endian bytes
//! spell the magic.

use std::io::{Read, Write};

use tracing::trace;

use crate::config::MAX_WIDTH;
use crate::error::{Result, SstError};

pub(crate) const MAGIC: [u8; 3] = *b"SST";
pub(crate) const VERSION: u8 = 1;

/// First frame on the first sub-connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hello {
    pub width: u8,
    pub nonce: u64,
}

/// What an accepted sub-connection opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opening {
    Hello(Hello),
    Join(u64),
}

/// Mint a session nonce that can never be mistaken for a hello.
pub(crate) fn fresh_nonce() -> u64 {
    loop {
        let nonce: u64 = rand::random();
        if nonce != 0 && nonce.to_le_bytes()[..3] != MAGIC {
            return nonce;
        }
    }
}

pub(crate) fn write_hello(conn: &mut impl Write, width: u8, nonce: u64) -> Result<()> {
    let mut buf = [0u8; 13];
    buf[..3].copy_from_slice(&MAGIC);
    buf[3] = VERSION;
    buf[4] = width;
    buf[5..].copy_from_slice(&nonce.to_le_bytes());
    conn.write_all(&buf).map_err(io_failed)?;
    conn.flush().map_err(io_failed)?;
    Ok(())
}

pub(crate) fn write_join(conn: &mut impl Write, nonce: u64) -> Result<()> {
    conn.write_all(&nonce.to_le_bytes()).map_err(io_failed)?;
    conn.flush().map_err(io_failed)?;
    Ok(())
}

pub(crate) fn write_confirm(conn: &mut impl Write, width: u8) -> Result<()> {
    let mut buf = [0u8; 5];
    buf[..3].copy_from_slice(&MAGIC);
    buf[3] = VERSION;
    buf[4] = width;
    conn.write_all(&buf).map_err(io_failed)?;
    conn.flush().map_err(io_failed)?;
    Ok(())
}

/// Initiator side: read the acceptor's confirm, returning the width it
/// committed to.
pub(crate) fn read_confirm(conn: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 5];
    read_exact(conn, &mut buf)?;
    if buf[..3] != MAGIC {
        return Err(SstError::HandshakeFailed("bad confirm magic".into()));
    }
    if buf[3] != VERSION {
        return Err(SstError::HandshakeFailed(format!(
            "unsupported protocol version {}",
            buf[3]
        )));
    }
    Ok(buf[4])
}

/// Acceptor side: classify and parse a sub-connection's opening bytes.
pub(crate) fn read_opening(conn: &mut impl Read) -> Result<Opening> {
    let mut head = [0u8; 8];
    read_exact(conn, &mut head[..3])?;

    if head[..3] == MAGIC {
        let mut meta = [0u8; 2];
        read_exact(conn, &mut meta)?;
        if meta[0] != VERSION {
            return Err(SstError::HandshakeFailed(format!(
                "unsupported protocol version {}",
                meta[0]
            )));
        }
        let width = meta[1];
        if width == 0 || width > MAX_WIDTH {
            return Err(SstError::HandshakeFailed(format!(
                "width {width} out of range 1..={MAX_WIDTH}"
            )));
        }
        let mut nonce_buf = [0u8; 8];
        read_exact(conn, &mut nonce_buf)?;
        trace!(width, "hello received");
        return Ok(Opening::Hello(Hello {
            width,
            nonce: u64::from_le_bytes(nonce_buf),
        }));
    }

    read_exact(conn, &mut head[3..])?;
    Ok(Opening::Join(u64::from_le_bytes(head)))
}

fn read_exact(conn: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    conn.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            SstError::PeerClosed
        } else {
            io_failed(err)
        }
    })
}

fn io_failed(err: std::io::Error) -> SstError {
    SstError::HandshakeFailed(err.to_string())
}
