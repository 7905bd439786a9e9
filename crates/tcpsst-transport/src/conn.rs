use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};

/// One established TCP connection.
///
/// Thin ownership wrapper around `TcpStream`: clones share the underlying
/// socket (separate file descriptors), which is how a reader half and a
/// writer half end up on different threads.
pub struct TcpConn {
    inner: TcpStream,
}

impl TcpConn {
    pub(crate) fn from_stream(inner: TcpStream) -> Self {
        Self { inner }
    }

    /// Connect to `addr`, trying each resolved address in turn.
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        Self::connect_timeout(addr, None)
    }

    /// Connect with an optional per-attempt timeout.
    pub fn connect_timeout(
        addr: impl ToSocketAddrs + std::fmt::Debug,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut last = None;
        for candidate in addr
            .to_socket_addrs()
            .map_err(|_| TransportError::Unresolvable(format!("{addr:?}")))?
        {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&candidate, t),
                None => TcpStream::connect(&candidate),
            };
            match attempt {
                Ok(stream) => {
                    debug!(addr = %candidate, "connected");
                    return Ok(Self { inner: stream });
                }
                Err(source) => {
                    last = Some(TransportError::Connect {
                        addr: candidate,
                        source,
                    })
                }
            }
        }
        Err(last.unwrap_or_else(|| TransportError::Unresolvable(format!("{addr:?}"))))
    }

    /// Duplicate the connection handle (new file descriptor, same socket).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            inner: self.inner.try_clone()?,
        })
    }

    /// Set the read timeout on this handle.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set the write timeout on this handle.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Disable Nagle's algorithm.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        self.inner.set_nodelay(nodelay).map_err(Into::into)
    }

    /// Half-close: no more bytes will be written from this side.
    pub fn shutdown_write(&self) -> Result<()> {
        self.inner.shutdown(Shutdown::Write).map_err(Into::into)
    }

    /// Stop receiving; a blocked read observes EOF.
    pub fn shutdown_read(&self) -> Result<()> {
        self.inner.shutdown(Shutdown::Read).map_err(Into::into)
    }

    /// Tear down both directions.
    pub fn shutdown_both(&self) -> Result<()> {
        self.inner.shutdown(Shutdown::Both).map_err(Into::into)
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr().map_err(Into::into)
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Into::into)
    }
}

impl Read for TcpConn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpConn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConn")
            .field("peer", &self.inner.peer_addr().ok())
            .finish()
    }
}
