//! Events feeding the owner task.
//!
//! Every mutation of registry state arrives here: application requests from
//! the facade, accept and connect completions, frames and deaths reported
//! by link tasks, and housekeeping ticks. The owner consumes them one at a
//! time, which is the whole concurrency story.

use hawser_core::{NodeId, TransportKind};
use tokio::sync::oneshot;

use crate::error::NetError;
use crate::link::{ChannelId, NewLink};

#[derive(Debug)]
pub(crate) enum RegistryEvent {
    /// Application wants `payload` delivered to `node` over `transport`.
    Send {
        node: NodeId,
        transport: TransportKind,
        payload: Vec<u8>,
    },

    /// Application wants a channel to exist, without sending anything yet.
    Connect {
        node: NodeId,
        transport: TransportKind,
    },

    /// An accept task registered a connection from an unknown peer.
    InboundAccepted { link: NewLink },

    /// An outbound connect attempt finished.
    ConnectFinished {
        node: NodeId,
        transport: TransportKind,
        outcome: Result<NewLink, NetError>,
    },

    /// A link task decoded a frame.
    FrameReceived {
        id: ChannelId,
        kind: u8,
        payload: Vec<u8>,
    },

    /// A link task exited; its connection is gone.
    LinkClosed { id: ChannelId },

    /// Housekeeping tick.
    Sweep,

    /// Tear everything down, then acknowledge.
    Shutdown { done: oneshot::Sender<()> },
}
