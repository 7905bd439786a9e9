//! Passive-side session establishment.
//!
//! One TCP acceptor serves every session: a sub-connection opening with a
//! hello starts a pending session keyed by its nonce, and joins attach to
//! it until the announced width is reached. `accept` returns each session
//! already `Connected`.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tcpsst_transport::{TcpAcceptor, TcpConn};
use tracing::{debug, trace};

use crate::callbacks::SubstreamCallback;
use crate::config::SessionConfig;
use crate::driver::Driver;
use crate::error::Result;
use crate::handshake::{read_opening, write_confirm, Opening};
use crate::session::{Side, SstSession};

struct Pending {
    width: u8,
    conns: Vec<TcpConn>,
    deadline: Instant,
}

/// Accepts incoming multiplexed sessions.
pub struct SstListener {
    acceptor: TcpAcceptor,
    driver: Arc<Driver>,
    config: SessionConfig,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl SstListener {
    /// Bind with the default configuration.
    pub fn bind(driver: &Arc<Driver>, addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        Self::bind_with_config(driver, addr, SessionConfig::default())
    }

    /// Bind with an explicit configuration. The initiator's hello decides
    /// each session's width; the local `config.width` is not consulted.
    pub fn bind_with_config(
        driver: &Arc<Driver>,
        addr: impl ToSocketAddrs + std::fmt::Debug,
        config: SessionConfig,
    ) -> Result<Self> {
        let acceptor = TcpAcceptor::bind(addr)?;
        Ok(Self {
            acceptor,
            driver: Arc::clone(driver),
            config,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// The bound address (with the ephemeral port resolved).
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Accept the next complete session. `substream` is invoked for every
    /// stream the peer opens on it.
    ///
    /// Handshake failures on individual sub-connections are logged and
    /// skipped; only acceptor-level errors surface.
    pub fn accept(&self, substream: SubstreamCallback) -> Result<Arc<SstSession>> {
        let mut substream = Some(substream);
        loop {
            self.sweep_pending();
            let mut conn = self.acceptor.accept()?;

            if let Err(err) = self.prepare(&conn) {
                debug!(%err, "handshake setup failed; connection dropped");
                continue;
            }
            let opening = match read_opening(&mut conn) {
                Ok(opening) => opening,
                Err(err) => {
                    debug!(%err, "bad opening; connection dropped");
                    continue;
                }
            };

            match opening {
                Opening::Hello(hello) => {
                    if let Err(err) = write_confirm(&mut conn, hello.width) {
                        debug!(%err, "confirm write failed; connection dropped");
                        continue;
                    }
                    if let Err(err) = self.settle(&conn) {
                        debug!(%err, "handshake teardown failed; connection dropped");
                        continue;
                    }
                    trace!(nonce = hello.nonce, width = hello.width, "hello accepted");
                    if hello.width == 1 {
                        if let Some(cb) = substream.take() {
                            return self.complete(hello.width, hello.nonce, vec![conn], cb);
                        }
                        continue;
                    }
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.insert(
                        hello.nonce,
                        Pending {
                            width: hello.width,
                            conns: vec![conn],
                            deadline: Instant::now() + self.config.handshake_timeout,
                        },
                    );
                }
                Opening::Join(nonce) => {
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    let filled = {
                        let Some(entry) = pending.get_mut(&nonce) else {
                            debug!(nonce, "join for unknown session; connection dropped");
                            continue;
                        };
                        if let Err(err) = write_confirm(&mut conn, entry.width) {
                            debug!(%err, "confirm write failed; connection dropped");
                            continue;
                        }
                        if let Err(err) = self.settle(&conn) {
                            debug!(%err, "handshake teardown failed; connection dropped");
                            continue;
                        }
                        entry.conns.push(conn);
                        trace!(
                            nonce,
                            have = entry.conns.len(),
                            want = entry.width,
                            "join attached"
                        );
                        entry.conns.len() == entry.width as usize
                    };
                    if filled {
                        let Some(entry) = pending.remove(&nonce) else {
                            continue;
                        };
                        drop(pending);
                        if let Some(cb) = substream.take() {
                            return self.complete(entry.width, nonce, entry.conns, cb);
                        }
                    }
                }
            }
        }
    }

    /// Apply handshake-phase socket options.
    fn prepare(&self, conn: &TcpConn) -> Result<()> {
        conn.set_nodelay(self.config.nodelay)?;
        conn.set_read_timeout(Some(self.config.handshake_timeout))?;
        conn.set_write_timeout(Some(self.config.handshake_timeout))?;
        Ok(())
    }

    /// Remove handshake-phase timeouts before steady-state I/O.
    fn settle(&self, conn: &TcpConn) -> Result<()> {
        conn.set_read_timeout(None)?;
        conn.set_write_timeout(None)?;
        Ok(())
    }

    fn complete(
        &self,
        width: u8,
        nonce: u64,
        conns: Vec<TcpConn>,
        substream: SubstreamCallback,
    ) -> Result<Arc<SstSession>> {
        let mut config = self.config.clone();
        config.width = width;
        let session = SstSession::new(
            config,
            Side::Acceptor,
            nonce,
            Arc::clone(&self.driver),
            Some(substream),
        );
        session.set_state_connecting();
        session.finish_connect(conns)?;
        Ok(session)
    }

    /// Drop half-joined sessions whose initiator went quiet.
    fn sweep_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        pending.retain(|nonce, entry| {
            if entry.deadline <= now {
                debug!(
                    nonce,
                    joined = entry.conns.len(),
                    want = entry.width,
                    "pending session expired"
                );
                false
            } else {
                true
            }
        });
    }
}

impl std::fmt::Debug for SstListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstListener")
            .field("addr", &self.acceptor.local_addr())
            .finish_non_exhaustive()
    }
}
