use std::time::Duration;

/// Widest sub-connection pool a session may negotiate.
pub const MAX_WIDTH: u8 = 16;

/// Default multiplex width.
pub const DEFAULT_WIDTH: u8 = 3;

/// Tunables for one multiplexed session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Number of parallel TCP sub-connections (initiator's choice,
    /// confirmed by the acceptor). Clamped to `1..=MAX_WIDTH`.
    pub width: u8,
    /// Per-sub-connection queued-byte threshold past which unreliable
    /// sends are dropped.
    pub high_water_mark: usize,
    /// Timeout for each TCP dial.
    pub connect_timeout: Duration,
    /// Timeout applied to handshake reads and writes.
    pub handshake_timeout: Duration,
    /// How long a locally-closed stream waits for the peer's `ACK_CLOSE`
    /// before being retired unconditionally.
    pub close_ack_timeout: Duration,
    /// Disable Nagle's algorithm on every sub-connection.
    pub nodelay: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            high_water_mark: 256 * 1024,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            close_ack_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

impl SessionConfig {
    /// Copy of this config with `width` forced into the valid range.
    pub(crate) fn clamped(&self) -> Self {
        let mut config = self.clone();
        config.width = config.width.clamp(1, MAX_WIDTH);
        config
    }
}
