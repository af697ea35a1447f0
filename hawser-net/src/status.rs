//! Connection status events.
//!
//! The registry reports connectivity changes per node and lane on an event
//! stream. Applications use it to learn when a peer became reachable or
//! went away; tests use it to wait for the registry to settle.

use hawser_core::{NodeId, TransportKind};
use tokio::sync::mpsc;

/// What changed for a node's connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// An outbound connection was requested.
    Requested,
    /// A channel is registered and usable on this lane.
    Established,
    /// The last channel on this lane is gone.
    Dropped,
    /// Messages queued while connecting were flushed onto a live channel.
    SendDelayed,
    /// Messages queued while connecting were discarded; the attempt failed
    /// for good and retrying is the caller's decision.
    DropDelayed,
}

/// One connectivity change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// The node whose connectivity changed.
    pub node: NodeId,
    /// Which lane changed.
    pub transport: TransportKind,
    /// What happened.
    pub kind: StatusKind,
}

/// Receiving side of the status stream.
///
/// Events stop after [`crate::ChannelRegistry::shutdown`]; `recv` then
/// returns `None`.
#[derive(Debug)]
pub struct StatusReceiver {
    pub(crate) inner: mpsc::UnboundedReceiver<StatusEvent>,
}

impl StatusReceiver {
    /// Wait for the next status event.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.inner.recv().await
    }

    /// Poll without waiting.
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.inner.try_recv().ok()
    }
}
