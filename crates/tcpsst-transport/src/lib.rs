//! TCP connect/accept plumbing for TCPSST.
//!
//! The multiplexed transport opens a small fixed pool of TCP connections
//! per peer; this crate provides the blocking bind/accept/connect
//! surface and the connection handle those layers build on.

pub mod conn;
pub mod error;
pub mod tcp;

pub use conn::TcpConn;
pub use error::{Result, TransportError};
pub use tcp::TcpAcceptor;
