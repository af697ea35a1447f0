//! Configuration for registry behavior.

use std::time::Duration;

use crate::wire::WireConfig;

/// Tunables for connection establishment, queueing and housekeeping.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Timeout for a single outbound connection attempt.
    pub connect_timeout: Duration,

    /// Maximum messages queued per node while its connection is pending.
    pub max_queue_size: usize,

    /// How long an accepted connection may stay unidentified before the
    /// sweep evicts it. Covers peers that connect and never handshake.
    pub identify_timeout: Duration,

    /// Interval between housekeeping sweeps.
    ///
    /// Set to `Duration::ZERO` to disable sweeping.
    pub sweep_interval: Duration,

    /// Maximum time shutdown waits for channel tasks to finish closing.
    pub shutdown_timeout: Duration,

    /// Wire-level limits, shared with every channel task.
    pub wire: WireConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_queue_size: 1000,
            identify_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            wire: WireConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            max_queue_size: 100,
            identify_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(1),
            wire: WireConfig::default(),
        }
    }

    /// Configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_queue_size: 5000,
            identify_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            wire: WireConfig::default(),
        }
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the per-node pending queue capacity.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Override the sweep cadence and the unidentified-channel deadline.
    pub fn with_sweep(mut self, interval: Duration, identify_timeout: Duration) -> Self {
        self.sweep_interval = interval;
        self.identify_timeout = identify_timeout;
        self
    }

    /// Override the shutdown wait.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
