use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

use tracing::{debug, info};

use crate::conn::TcpConn;
use crate::error::{Result, TransportError};

/// A bound, listening TCP socket.
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    /// Bind and listen on `addr`. Port 0 picks an ephemeral port; the
    /// chosen address is available from [`TcpAcceptor::local_addr`].
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        let listener = TcpListener::bind(&addr).map_err(|source| TransportError::Bind {
            addr: format!("{addr:?}"),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<TcpConn> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(peer = %peer, "accepted connection");
        Ok(TcpConn::from_stream(stream))
    }

    /// The address this acceptor is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
