//! TCPSST: an arbitrary number of logical, independently addressable,
//! optionally reliable/ordered byte streams over a small fixed pool of
//! TCP connections between two peers.
//!
//! The active side calls [`connect`], which returns the first logical
//! stream immediately and finishes the handshake in the background; the
//! passive side binds an [`SstListener`] and gets each session back
//! already connected. Further streams come from
//! [`SstStream::clone_from`] / [`session::SstSession::open_stream`]
//! locally, or from the substream callback when the peer opens them.
//!
//! Delivery is callback-based and fire-and-forget: payloads arrive via
//! per-stream bytes callbacks on I/O threads, transport failure arrives
//! as a single disconnect event per stream, and `send` only errors on
//! caller mistakes.

mod connection;
mod control;
mod handshake;
mod send_status;

pub mod callbacks;
pub mod config;
pub mod connector;
pub mod driver;
pub mod error;
pub mod listener;
pub mod session;
pub mod stream;

pub use callbacks::{
    BytesCallback, ConnectionCallback, ConnectionStatus, StreamCallbacks, SubstreamCallback,
};
pub use config::{SessionConfig, DEFAULT_WIDTH, MAX_WIDTH};
pub use connector::{connect, connect_with_config};
pub use driver::Driver;
pub use error::{Result, SstError};
pub use listener::SstListener;
pub use session::{SessionState, Side, SstSession};
pub use stream::{Reliability, SstStream};

pub use tcpsst_frame::StreamId;
