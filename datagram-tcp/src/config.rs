//! Tunable protocol parameters.
//!
//! Every [`crate::connection::Connection`] carries a copy of a
//! [`ConnectionConfig`].  The binary fills one in from CLI flags; tests use
//! the builder methods to shrink timeouts.

use std::time::Duration;

/// How long a single receive waits for a qualifying datagram.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Pause between acknowledging the peer's FIN and sending our own.
pub const DEFAULT_CLOSE_PAUSE: Duration = Duration::from_millis(200);

/// Retries allowed per send / receive / close call.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Whether the handshake applies origin and checksum checks before the remote
/// endpoint has been latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeCheck {
    /// Any SYN / SYN_ACK is accepted and its origin latched as the remote.
    #[default]
    Lenient,
    /// SYN and SYN_ACK must carry a valid checksum, and a SYN_ACK must come
    /// from the address that was dialled.  The port may differ since the peer
    /// answers from a freshly allocated one.
    Strict,
}

/// Adjustable timeout and retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub timeout: Duration,
    pub close_pause: Duration,
    pub max_retries: u32,
    pub handshake_check: HandshakeCheck,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            close_pause: DEFAULT_CLOSE_PAUSE,
            max_retries: DEFAULT_MAX_RETRIES,
            handshake_check: HandshakeCheck::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_close_pause(mut self, pause: Duration) -> Self {
        self.close_pause = pause;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_handshake_check(mut self, check: HandshakeCheck) -> Self {
        self.handshake_check = check;
        self
    }
}
