//! Per-peer channel bookkeeping.
//!
//! A [`Lane`] is the channel set for one (node, transport) pair: its
//! members, duplicates included, and the single active designation used for
//! outbound traffic. Records for all channels, identified or not, live in
//! one map keyed by channel id; lanes only hold ids.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use hawser_core::{NodeId, SocketEndpoint, TransportKind};
use tokio::task::{AbortHandle, JoinHandle};

use crate::link::{ChannelHandle, ChannelId};

/// Lifecycle of a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    /// Usable member of its channel set.
    Open,
    /// A close handshake is in flight; the record stays until the peer
    /// answers or the connection dies.
    Closing,
}

/// Everything the owner tracks about one channel.
#[derive(Debug)]
pub(crate) struct ChannelRecord {
    pub handle: ChannelHandle,
    pub task: JoinHandle<()>,
    pub state: ChannelState,
    /// Set once the channel is identified; inbound channels start without.
    pub node: Option<NodeId>,
    /// Owner clock at registration; drives unidentified-channel eviction.
    pub opened_at: Duration,
}

/// The channel set for one (node, transport) pair.
#[derive(Debug, Default)]
pub(crate) struct Lane {
    /// Identified channels to this peer, duplicates included.
    pub members: HashSet<ChannelId>,
    /// The channel designated for outbound traffic, always a member.
    pub active: Option<ChannelId>,
}

impl Lane {
    /// Members eligible for duplicate resolution: open, not mid-close.
    pub fn candidates<'a>(
        &'a self,
        channels: &'a HashMap<ChannelId, ChannelRecord>,
    ) -> impl Iterator<Item = &'a ChannelRecord> + 'a {
        self.members
            .iter()
            .filter_map(|id| channels.get(id))
            .filter(|record| record.state == ChannelState::Open)
    }

    /// The deterministic survivor of a duplicate race: the minimum open
    /// member under [`rank_key`].
    pub fn min_ranked(&self, channels: &HashMap<ChannelId, ChannelRecord>) -> Option<ChannelId> {
        self.candidates(channels)
            .min_by_key(|record| rank_key(&record.handle))
            .map(|record| record.handle.id)
    }
}

/// Everything the registry tracks for one remote node: a lane per
/// transport plus the pending slot that guarantees at most one in-flight
/// connect per (node, transport).
#[derive(Debug, Default)]
pub(crate) struct NodeState {
    pub stream: Lane,
    pub datagram: Lane,
    pub pending_stream: Option<PendingConnect>,
    pub pending_datagram: Option<PendingConnect>,
}

impl NodeState {
    pub fn lane(&self, transport: TransportKind) -> &Lane {
        match transport {
            TransportKind::Stream => &self.stream,
            TransportKind::Datagram => &self.datagram,
        }
    }

    pub fn lane_mut(&mut self, transport: TransportKind) -> &mut Lane {
        match transport {
            TransportKind::Stream => &mut self.stream,
            TransportKind::Datagram => &mut self.datagram,
        }
    }

    pub fn pending(&self, transport: TransportKind) -> Option<&PendingConnect> {
        match transport {
            TransportKind::Stream => self.pending_stream.as_ref(),
            TransportKind::Datagram => self.pending_datagram.as_ref(),
        }
    }

    pub fn pending_mut(&mut self, transport: TransportKind) -> &mut Option<PendingConnect> {
        match transport {
            TransportKind::Stream => &mut self.pending_stream,
            TransportKind::Datagram => &mut self.pending_datagram,
        }
    }

    /// True once nothing references this node anymore, at which point its
    /// entry can be dropped.
    pub fn is_empty(&self) -> bool {
        self.stream.members.is_empty()
            && self.datagram.members.is_empty()
            && self.pending_stream.is_none()
            && self.pending_datagram.is_none()
    }
}

/// Where traffic for a node waits until its connection exists.
#[derive(Debug)]
pub(crate) struct PendingConnect {
    pub state: PendingState,
    /// Sends queued until the connect resolves, oldest first.
    pub queue: Vec<Vec<u8>>,
}

impl PendingConnect {
    pub fn dialing(abort: AbortHandle) -> Self {
        Self {
            state: PendingState::Dialing { abort },
            queue: Vec::new(),
        }
    }

    pub fn parked() -> Self {
        Self {
            state: PendingState::AwaitingHandshake,
            queue: Vec::new(),
        }
    }

    pub fn is_parked(&self) -> bool {
        matches!(self.state, PendingState::AwaitingHandshake)
    }
}

/// Why a pending entry has not produced a channel yet.
#[derive(Debug)]
pub(crate) enum PendingState {
    /// A connect attempt is in flight.
    Dialing { abort: AbortHandle },
    /// Datagram request parked until the peer's stream handshake reveals
    /// its datagram endpoint.
    AwaitingHandshake,
}

/// Ordering key for duplicate resolution.
///
/// Rank first; ties fall back to the endpoint pair in sorted order. Both
/// components read the same from either end of a connection, which is what
/// lets two racing peers pick the same survivor without coordinating.
pub(crate) fn rank_key(handle: &ChannelHandle) -> (u32, SocketEndpoint, SocketEndpoint) {
    let (lo, hi) = if handle.local <= handle.remote {
        (handle.local.clone(), handle.remote.clone())
    } else {
        (handle.remote.clone(), handle.local.clone())
    };
    (handle.rank(), lo, hi)
}
