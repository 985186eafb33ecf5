//! Reconnection backoff policy.
//!
//! The server's `advice.reconnect` value decides *whether* the client
//! retries a connect or re-handshakes; this module only tracks *how long*
//! the client waits between attempts. The increment is linear and
//! deterministic (no jitter) so that backoff sequences are reproducible in
//! tests and the "non-decreasing, capped, reset on success" invariant is
//! exact rather than approximate.

use std::time::Duration;

/// Configuration for the linear backoff applied between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Amount added to the current backoff after each failed attempt.
    pub backoff_increment: Duration,
    /// Upper bound the backoff never exceeds.
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_increment: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectConfig {
    /// Computes the next backoff given the current one.
    ///
    /// `nextBackoff = min(current + backoffIncrement, maxBackoff)`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current + self.backoff_increment).min(self.max_backoff)
    }
}
