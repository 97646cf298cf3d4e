//! Engine timing configuration.

use std::time::Duration;
use ajaxbridge_core::constants::{
    DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_PAIRING_WINDOW_SECS,
    RECONNECT_BACKOFF_INITIAL_MS, RECONNECT_BACKOFF_MAX_MS,
};

/// Every bounded wait in the engine, in one place.
///
/// No engine operation blocks without one of these upper bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Window for a command to be acknowledged.
    pub command_timeout: Duration,
    /// Silence threshold while a command is outstanding; crossing it is
    /// treated as link loss.
    pub idle_timeout: Duration,
    /// Overall window for a pairing session to resolve.
    pub pairing_window: Duration,
    /// First reconnect delay after link loss.
    pub reconnect_initial: Duration,
    /// Ceiling for the doubling reconnect backoff.
    pub reconnect_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            pairing_window: Duration::from_secs(DEFAULT_PAIRING_WINDOW_SECS),
            reconnect_initial: Duration::from_millis(RECONNECT_BACKOFF_INITIAL_MS),
            reconnect_max: Duration::from_millis(RECONNECT_BACKOFF_MAX_MS),
        }
    }
}

impl EngineConfig {
    /// Next backoff step: double, capped at the ceiling.
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.reconnect_max)
    }
}
