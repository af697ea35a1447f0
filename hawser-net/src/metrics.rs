//! Counters tracking registry activity.

/// Counters for one registry instance.
///
/// Updated by the owner task, snapshotted on demand through
/// [`crate::ChannelRegistry::metrics`]. Counters only ever grow.
#[derive(Debug, Clone, Default)]
pub struct RegistryMetrics {
    /// Outbound connection attempts, both lanes.
    pub connect_attempts: u64,

    /// Outbound connections established.
    pub connect_successes: u64,

    /// Outbound connections that failed or timed out.
    pub connect_failures: u64,

    /// Channels registered, inbound and outbound.
    pub channels_opened: u64,

    /// Channels fully torn down.
    pub channels_closed: u64,

    /// Duplicate channels retired by rank resolution.
    pub duplicates_resolved: u64,

    /// Data frames handed to a channel for sending.
    pub messages_sent: u64,

    /// Data frames delivered to the application.
    pub messages_received: u64,

    /// Messages dropped: queue overflow, teardown, shutdown.
    pub messages_dropped: u64,
}

impl RegistryMetrics {
    /// Record an outbound connection attempt.
    pub fn record_connect_attempt(&mut self) {
        self.connect_attempts += 1;
    }

    /// Record an established outbound connection.
    pub fn record_connect_success(&mut self) {
        self.connect_successes += 1;
    }

    /// Record a failed or timed-out outbound connection.
    pub fn record_connect_failure(&mut self) {
        self.connect_failures += 1;
    }

    /// Record a channel entering the registry.
    pub fn record_channel_opened(&mut self) {
        self.channels_opened += 1;
    }

    /// Record a channel leaving the registry.
    pub fn record_channel_closed(&mut self) {
        self.channels_closed += 1;
    }

    /// Record a duplicate channel retired by rank resolution.
    pub fn record_duplicate_resolved(&mut self) {
        self.duplicates_resolved += 1;
    }

    /// Record a message handed to a channel.
    pub fn record_message_sent(&mut self) {
        self.messages_sent += 1;
    }

    /// Record a message delivered to the application.
    pub fn record_message_received(&mut self) {
        self.messages_received += 1;
    }

    /// Record a dropped message.
    pub fn record_message_dropped(&mut self) {
        self.messages_dropped += 1;
    }

    /// Connection success rate as a percentage.
    pub fn connect_success_rate(&self) -> f64 {
        if self.connect_attempts == 0 {
            100.0
        } else {
            (self.connect_successes as f64 / self.connect_attempts as f64) * 100.0
        }
    }
}
