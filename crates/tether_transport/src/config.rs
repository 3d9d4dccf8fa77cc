//! Transport configuration.

use std::time::Duration;

/// Send-side chunk size, in bytes.
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 40_000;

/// Largest payload accepted from a peer.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Liveness probe timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Delay before the first probe.
    pub first_probe: Duration,
    /// Delay between probes.
    pub interval: Duration,
    /// How long a probe waits for the socket to report readable.
    pub poll_timeout: Duration,
}

impl GuardConfig {
    /// Sets the delay before the first probe.
    pub fn with_first_probe(mut self, delay: Duration) -> Self {
        self.first_probe = delay;
        self
    }

    /// Sets the probe interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the probe poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            first_probe: Duration::from_secs(2),
            interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(3),
        }
    }
}

/// Configuration for one framed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Writes are split into chunks of this many bytes.
    pub send_buffer_size: usize,
    /// A read fails once no new bytes arrive for this long mid-frame.
    pub stall_timeout: Duration,
    /// Frames announcing a larger payload are rejected.
    pub max_frame_size: usize,
    /// Liveness guard timing.
    pub guard: GuardConfig,
}

impl TransportConfig {
    /// Sets the send chunk size.
    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size.max(1);
        self
    }

    /// Sets the read stall timeout.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Sets the maximum accepted payload size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the guard timing.
    pub fn with_guard(mut self, guard: GuardConfig) -> Self {
        self.guard = guard;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            stall_timeout: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            guard: GuardConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.send_buffer_size, 40_000);
        assert_eq!(config.stall_timeout, Duration::from_secs(30));
        assert_eq!(config.guard.first_probe, Duration::from_secs(2));
        assert_eq!(config.guard.interval, Duration::from_secs(5));
        assert_eq!(config.guard.poll_timeout, Duration::from_secs(3));
    }

    #[test]
    fn config_builder() {
        let config = TransportConfig::default()
            .with_send_buffer_size(0)
            .with_stall_timeout(Duration::from_millis(200))
            .with_guard(GuardConfig::default().with_interval(Duration::from_millis(50)));
        assert_eq!(config.send_buffer_size, 1);
        assert_eq!(config.stall_timeout, Duration::from_millis(200));
        assert_eq!(config.guard.interval, Duration::from_millis(50));
    }
}
