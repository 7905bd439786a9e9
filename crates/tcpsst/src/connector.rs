//! Active-side session establishment.
//!
//! `connect` returns the first logical stream immediately; the dials and
//! the handshake run on a driver thread. Success or failure arrives
//! through the stream's connection callback, and sends issued in the
//! meantime are queued and flushed in order.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use tcpsst_transport::{TcpConn, TransportError};
use tracing::debug;

use crate::callbacks::{StreamCallbacks, SubstreamCallback};
use crate::config::SessionConfig;
use crate::driver::Driver;
use crate::error::{Result, SstError};
use crate::handshake::{fresh_nonce, read_confirm, write_hello, write_join};
use crate::session::{Side, SstSession};
use crate::stream::SstStream;

/// Connect with the default configuration (width 3).
pub fn connect(
    driver: &Arc<Driver>,
    addr: impl ToSocketAddrs + std::fmt::Debug,
    substream: SubstreamCallback,
    callbacks: StreamCallbacks,
) -> Result<SstStream> {
    connect_with_config(driver, addr, SessionConfig::default(), substream, callbacks)
}

/// Connect with an explicit configuration.
pub fn connect_with_config(
    driver: &Arc<Driver>,
    addr: impl ToSocketAddrs + std::fmt::Debug,
    config: SessionConfig,
    substream: SubstreamCallback,
    callbacks: StreamCallbacks,
) -> Result<SstStream> {
    let config = config.clamped();
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|_| TransportError::Unresolvable(format!("{addr:?}")))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Unresolvable(format!("{addr:?}")).into());
    }

    let nonce = fresh_nonce();
    let session = SstSession::new(
        config,
        Side::Initiator,
        nonce,
        Arc::clone(driver),
        Some(substream),
    );
    let stream = session.register_first_stream(callbacks)?;
    session.set_state_connecting();

    let dial_session = Arc::clone(&session);
    driver
        .spawn("connect", move || run_dial(dial_session, addrs))
        .map_err(|e| SstError::Transport(e.into()))?;

    Ok(stream)
}

fn run_dial(session: Arc<SstSession>, addrs: Vec<SocketAddr>) {
    match dial_all(&session, &addrs) {
        Ok(conns) => {
            if let Err(err) = session.finish_connect(conns) {
                session.shutdown();
                session.fail_connect(&err.to_string());
            }
        }
        Err(err) => session.fail_connect(&err.to_string()),
    }
}

/// Open the sub-connection pool sequentially. The first dial carries the
/// hello; later ones join by nonce. Any failure drops the connections
/// opened so far.
fn dial_all(session: &Arc<SstSession>, addrs: &[SocketAddr]) -> Result<Vec<TcpConn>> {
    let config = session.config();
    let width = config.width;
    let nonce = session.nonce();

    let mut conns: Vec<TcpConn> = Vec::with_capacity(width as usize);
    let mut target: Option<SocketAddr> = None;

    for index in 0..width {
        let mut conn = match target {
            Some(addr) => TcpConn::connect_timeout(addr, Some(config.connect_timeout))?,
            None => {
                let (conn, addr) = dial_first(addrs, config)?;
                target = Some(addr);
                conn
            }
        };
        conn.set_nodelay(config.nodelay)?;
        conn.set_read_timeout(Some(config.handshake_timeout))?;
        conn.set_write_timeout(Some(config.handshake_timeout))?;

        if index == 0 {
            write_hello(&mut conn, width, nonce)?;
        } else {
            write_join(&mut conn, nonce)?;
        }
        let confirmed = read_confirm(&mut conn)?;
        if confirmed != width {
            return Err(SstError::HandshakeFailed(format!(
                "peer confirmed width {confirmed}, expected {width}"
            )));
        }

        conn.set_read_timeout(None)?;
        conn.set_write_timeout(None)?;
        debug!(conn = index, width, "sub-connection handshaken");
        conns.push(conn);
    }
    Ok(conns)
}

fn dial_first(addrs: &[SocketAddr], config: &SessionConfig) -> Result<(TcpConn, SocketAddr)> {
    let mut last: Option<SstError> = None;
    for &addr in addrs {
        match TcpConn::connect_timeout(addr, Some(config.connect_timeout)) {
            Ok(conn) => return Ok((conn, addr)),
            Err(err) => last = Some(err.into()),
        }
    }
    Err(last.unwrap_or_else(|| SstError::ConnectionFailed("no addresses to dial".into())))
}
