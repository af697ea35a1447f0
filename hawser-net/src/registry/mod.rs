//! The connection registry: stable identities over volatile connections.
//!
//! A node is addressed by one [`NodeId`], the endpoint of its stream
//! listener, for as long as it runs. Underneath, connections come and go:
//! both sides may dial each other at once, a crash may be followed by a
//! reconnect, and the datagram lane lives on a random port that changes
//! every restart. [`ChannelRegistry`] absorbs all of that. Callers send to
//! a `(node, transport)` pair; the registry finds or establishes a channel,
//! queues while connecting, collapses duplicate connections onto one
//! deterministic survivor, and reports reachability changes on a status
//! stream.
//!
//! Identity works handshake-first. A registry learns a peer's datagram
//! endpoint only from the identification handshake on a stream channel, so
//! datagram connects to an unknown peer park until a stream channel to it
//! exists. The learned endpoint stays cached only while some stream channel
//! to the peer is up; when the last one goes, the datagram lane and its
//! cache entry are torn down with it, on the grounds that a peer that lost
//! its stream lane may come back with a different datagram port.
//!
//! One task owns every piece of registry state and applies events in
//! arrival order; the handle here is a thin front that feeds it. Handles on
//! different nodes of the same process do not share anything.

pub(crate) mod event;
pub(crate) mod lane;
mod owner;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use hawser_core::{
    NodeId, Providers, SocketEndpoint, TaskProvider, TimeProvider, TransportConnector,
    TransportKind, TransportListener,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::RegistryConfig;
use crate::error::NetError;
use crate::link::{spawn_link, ChannelIds};
use crate::metrics::RegistryMetrics;
use crate::registry::event::RegistryEvent;
use crate::registry::owner::{Owner, RegistryShared};
use crate::status::StatusReceiver;
use crate::wire::{WireConfig, WireError, HEADER_SIZE};

/// A message delivered by a remote registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Identity of the sending node.
    pub source: NodeId,
    /// Lane the message arrived on.
    pub transport: TransportKind,
    /// Application payload, exactly as sent.
    pub payload: Vec<u8>,
}

/// Receiving side of the inbound message stream.
///
/// Delivery stops after [`ChannelRegistry::shutdown`]; `recv` then returns
/// `None`.
#[derive(Debug)]
pub struct IncomingReceiver {
    pub(crate) inner: mpsc::UnboundedReceiver<IncomingMessage>,
}

impl IncomingReceiver {
    /// Wait for the next inbound message.
    pub async fn recv(&mut self) -> Option<IncomingMessage> {
        self.inner.recv().await
    }

    /// Poll without waiting.
    pub fn try_recv(&mut self) -> Option<IncomingMessage> {
        self.inner.try_recv().ok()
    }
}

/// Point-in-time registry bookkeeping counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Nodes with at least one registered channel.
    pub known_nodes: usize,
    /// Live channels, identified or not, duplicates included.
    pub open_channels: usize,
    /// Connect attempts currently in flight.
    pub pending_connects: usize,
    /// Datagram requests parked until a stream handshake reveals the
    /// peer's datagram endpoint.
    pub deferred_datagrams: usize,
    /// Messages queued behind pending connects.
    pub queued_messages: usize,
    /// Remote connection endpoints mapped back to a node identity.
    pub identified_endpoints: usize,
}

/// A running registry node: two listeners, an owner task, and this handle.
///
/// Dropping the handle does not stop the node; call
/// [`ChannelRegistry::shutdown`] for an ordered teardown.
#[derive(Debug)]
pub struct ChannelRegistry {
    local: NodeId,
    stream_local: SocketEndpoint,
    datagram_local: SocketEndpoint,
    events: mpsc::UnboundedSender<RegistryEvent>,
    shared: Rc<RefCell<RegistryShared>>,
    owner: JoinHandle<()>,
    incoming: Option<IncomingReceiver>,
    status: Option<StatusReceiver>,
    max_frame_len: usize,
}

impl ChannelRegistry {
    /// Bind both listeners and start the registry.
    ///
    /// `stream_endpoint` becomes the node's stable identity, so it should
    /// be the well-known address peers dial. `datagram_endpoint` is
    /// typically bound with port 0; peers learn the assigned port through
    /// the identification handshake, never out of band.
    ///
    /// Must be called from within a `tokio::task::LocalSet`.
    pub async fn bind<P: Providers>(
        providers: P,
        config: RegistryConfig,
        stream_endpoint: &SocketEndpoint,
        datagram_endpoint: &SocketEndpoint,
    ) -> Result<Self, NetError> {
        let stream_listener = providers.stream().bind(stream_endpoint).await?;
        let datagram_listener = providers.datagram().bind(datagram_endpoint).await?;
        let stream_local = stream_listener.local_endpoint()?;
        let datagram_local = datagram_listener.local_endpoint()?;
        let local = NodeId::new(stream_local.clone());
        tracing::info!(node = %local, datagram = %datagram_local, "registry listening");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let shared = Rc::new(RefCell::new(RegistryShared::default()));
        let ids = ChannelIds::new();
        let tasks = providers.task().clone();
        let wire = config.wire;

        let mut aux = Vec::new();
        let accept_stream = tasks.spawn_task(
            "accept-stream",
            accept_loop(
                stream_listener,
                TransportKind::Stream,
                tasks.clone(),
                ids.clone(),
                wire,
                events_tx.clone(),
            ),
        );
        aux.push(accept_stream.abort_handle());
        let accept_datagram = tasks.spawn_task(
            "accept-datagram",
            accept_loop(
                datagram_listener,
                TransportKind::Datagram,
                tasks.clone(),
                ids.clone(),
                wire,
                events_tx.clone(),
            ),
        );
        aux.push(accept_datagram.abort_handle());
        if config.sweep_interval > Duration::ZERO {
            let sweep = tasks.spawn_task(
                "sweep",
                sweep_loop(
                    providers.time().clone(),
                    config.sweep_interval,
                    events_tx.clone(),
                ),
            );
            aux.push(sweep.abort_handle());
        }

        let max_frame_len = config.wire.max_frame_len;
        let owner = Owner::new(
            providers,
            config,
            local.clone(),
            datagram_local.clone(),
            ids,
            events_tx.clone(),
            incoming_tx,
            status_tx,
            Rc::clone(&shared),
            aux,
        );
        let owner_task = tasks.spawn_task("registry-owner", owner.run(events_rx));

        Ok(Self {
            local,
            stream_local,
            datagram_local,
            events: events_tx,
            shared,
            owner: owner_task,
            incoming: Some(IncomingReceiver { inner: incoming_rx }),
            status: Some(StatusReceiver { inner: status_rx }),
            max_frame_len,
        })
    }

    /// This node's stable identity.
    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    /// Endpoint the stream listener is bound to.
    pub fn stream_endpoint(&self) -> &SocketEndpoint {
        &self.stream_local
    }

    /// Endpoint the datagram listener is bound to.
    pub fn datagram_endpoint(&self) -> &SocketEndpoint {
        &self.datagram_local
    }

    /// Send a payload to a node over the given lane.
    ///
    /// Fire and forget: queues if the lane is still connecting, starts a
    /// connect if none is in flight. Oversized payloads are rejected here
    /// rather than poisoning a channel later.
    pub fn send(
        &self,
        node: &NodeId,
        transport: TransportKind,
        payload: Vec<u8>,
    ) -> Result<(), NetError> {
        let length = HEADER_SIZE + payload.len();
        if length > self.max_frame_len {
            return Err(NetError::Wire(WireError::FrameTooLarge {
                length,
                max: self.max_frame_len,
            }));
        }
        self.events
            .send(RegistryEvent::Send {
                node: node.clone(),
                transport,
                payload,
            })
            .map_err(|_| NetError::ShuttingDown)
    }

    /// Establish a channel to a node without sending anything yet.
    ///
    /// No-op if the lane already has an active channel or a connect in
    /// flight.
    pub fn request_channel(&self, node: &NodeId, transport: TransportKind) -> Result<(), NetError> {
        self.events
            .send(RegistryEvent::Connect {
                node: node.clone(),
                transport,
            })
            .map_err(|_| NetError::ShuttingDown)
    }

    /// Remote endpoint of the channel currently routing traffic for this
    /// lane, if any. Snapshot; the designation can change as duplicate
    /// connections resolve.
    pub fn active_remote(&self, node: &NodeId, transport: TransportKind) -> Option<SocketEndpoint> {
        self.shared
            .borrow()
            .actives
            .get(&(node.clone(), transport))
            .cloned()
    }

    /// Current bookkeeping counts.
    pub fn stats(&self) -> RegistryStats {
        self.shared.borrow().stats
    }

    /// Snapshot of the traffic counters.
    pub fn metrics(&self) -> RegistryMetrics {
        self.shared.borrow().metrics.clone()
    }

    /// Take the inbound message stream. Yields `Some` once.
    pub fn take_incoming(&mut self) -> Option<IncomingReceiver> {
        self.incoming.take()
    }

    /// Take the status event stream. Yields `Some` once.
    pub fn take_status(&mut self) -> Option<StatusReceiver> {
        self.status.take()
    }

    /// Ordered shutdown: stop accepting, cancel pending connects, close
    /// every channel and wait for their tasks, bounded by the configured
    /// shutdown timeout.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .events
            .send(RegistryEvent::Shutdown { done: done_tx })
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let _ = self.owner.await;
    }
}

/// Accept connections on one lane and register them.
async fn accept_loop<L, T>(
    mut listener: L,
    transport: TransportKind,
    tasks: T,
    ids: ChannelIds,
    wire: WireConfig,
    events: mpsc::UnboundedSender<RegistryEvent>,
) where
    L: TransportListener,
    T: TaskProvider,
{
    loop {
        match listener.accept().await {
            Ok(conn) => {
                let link = spawn_link(&tasks, ids.next_id(), transport, conn, wire, events.clone());
                // A failed send drops the link's command handle, which
                // makes the link task close the connection on its own.
                if events
                    .send(RegistryEvent::InboundAccepted { link })
                    .is_err()
                {
                    break;
                }
            }
            Err(error) => {
                tracing::warn!(%transport, %error, "accept failed, stopping listener");
                break;
            }
        }
    }
}

/// Tick the owner's housekeeping sweep.
async fn sweep_loop<T: TimeProvider>(
    time: T,
    interval: Duration,
    events: mpsc::UnboundedSender<RegistryEvent>,
) {
    loop {
        time.sleep(interval).await;
        if events.send(RegistryEvent::Sweep).is_err() {
            break;
        }
    }
}
