//! The owner task: all registry state behind one event loop.
//!
//! Every map in the registry is owned by a single task that consumes
//! [`RegistryEvent`]s in arrival order. Accept loops, link tasks, connect
//! attempts and the facade all talk to it through the same unbounded queue,
//! so no handler ever observes half-applied state and none of the state
//! needs locking. Handlers are synchronous; the only await in the loop is
//! the queue itself, plus the bounded drain during shutdown.
//!
//! The facade still wants cheap reads (active endpoints, stats, metrics),
//! so the owner mirrors those into [`RegistryShared`] after each event.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use hawser_core::{
    JsonCodec, NodeId, Providers, SocketEndpoint, TaskProvider, TimeProvider, TransportConnector,
    TransportKind,
};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::RegistryConfig;
use crate::control::{self, ControlMessage};
use crate::error::NetError;
use crate::link::{spawn_link, ChannelId, ChannelIds, LinkCommand, NewLink};
use crate::metrics::RegistryMetrics;
use crate::registry::event::RegistryEvent;
use crate::registry::lane::{
    ChannelRecord, ChannelState, NodeState, PendingConnect, PendingState,
};
use crate::registry::{IncomingMessage, RegistryStats};
use crate::status::{StatusEvent, StatusKind};
use crate::wire::FrameKind;

/// State mirrored out of the owner task for lock-free facade reads.
#[derive(Debug, Default)]
pub(crate) struct RegistryShared {
    pub stats: RegistryStats,
    pub metrics: RegistryMetrics,
    /// Remote endpoint of the active channel per (node, transport).
    pub actives: HashMap<(NodeId, TransportKind), SocketEndpoint>,
}

/// The registry owner. Constructed by [`super::ChannelRegistry::bind`] and
/// consumed by [`Owner::run`].
pub(crate) struct Owner<P: Providers> {
    providers: P,
    config: RegistryConfig,
    codec: JsonCodec,
    /// Our stable identity: the stream listener endpoint.
    local: NodeId,
    /// Our datagram listener endpoint, advertised in every handshake.
    datagram_local: SocketEndpoint,
    ids: ChannelIds,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
    incoming_tx: mpsc::UnboundedSender<IncomingMessage>,
    status_tx: mpsc::UnboundedSender<StatusEvent>,
    shared: Rc<RefCell<RegistryShared>>,
    /// Accept loops and the sweep ticker, aborted on shutdown.
    aux: Vec<AbortHandle>,

    /// Every live channel, identified or not, keyed by id.
    channels: HashMap<ChannelId, ChannelRecord>,
    /// Per-node lanes and pending connects.
    nodes: HashMap<NodeId, NodeState>,
    /// Remote connection endpoint back to the identity behind it.
    reverse: HashMap<SocketEndpoint, NodeId>,
    /// Datagram listener endpoints learned from handshakes. An entry is
    /// only valid while at least one stream channel to that node exists.
    datagram_cache: HashMap<NodeId, SocketEndpoint>,
}

impl<P: Providers> Owner<P> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        providers: P,
        config: RegistryConfig,
        local: NodeId,
        datagram_local: SocketEndpoint,
        ids: ChannelIds,
        events_tx: mpsc::UnboundedSender<RegistryEvent>,
        incoming_tx: mpsc::UnboundedSender<IncomingMessage>,
        status_tx: mpsc::UnboundedSender<StatusEvent>,
        shared: Rc<RefCell<RegistryShared>>,
        aux: Vec<AbortHandle>,
    ) -> Self {
        Self {
            providers,
            config,
            codec: JsonCodec,
            local,
            datagram_local,
            ids,
            events_tx,
            incoming_tx,
            status_tx,
            shared,
            aux,
            channels: HashMap::new(),
            nodes: HashMap::new(),
            reverse: HashMap::new(),
            datagram_cache: HashMap::new(),
        }
    }

    /// Consume events until shutdown.
    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<RegistryEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                RegistryEvent::Shutdown { done } => {
                    self.shutdown().await;
                    let _ = done.send(());
                    break;
                }
                event => {
                    self.handle_event(event);
                    self.publish();
                }
            }
        }
        // Events that raced shutdown can only carry stray connections;
        // close them so nothing leaks past the registry's lifetime.
        while let Ok(event) = events.try_recv() {
            self.discard(event);
        }
    }

    fn handle_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Send {
                node,
                transport,
                payload,
            } => self.on_send(node, transport, payload),
            RegistryEvent::Connect { node, transport } => self.on_connect_requested(node, transport),
            RegistryEvent::InboundAccepted { link } => self.on_inbound(link),
            RegistryEvent::ConnectFinished {
                node,
                transport,
                outcome,
            } => self.on_connect_finished(node, transport, outcome),
            RegistryEvent::FrameReceived { id, kind, payload } => self.on_frame(id, kind, payload),
            RegistryEvent::LinkClosed { id } => self.on_link_closed(id),
            RegistryEvent::Sweep => self.on_sweep(),
            RegistryEvent::Shutdown { done } => {
                // run() intercepts shutdown before dispatch; acknowledge
                // anyway so a caller never hangs on the oneshot.
                let _ = done.send(());
            }
        }
    }

    fn discard(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::ConnectFinished {
                outcome: Ok(link), ..
            }
            | RegistryEvent::InboundAccepted { link } => {
                tracing::debug!(channel = %link.handle.id, "closing connection that raced shutdown");
                link.handle.send(LinkCommand::Close);
            }
            RegistryEvent::Shutdown { done } => {
                let _ = done.send(());
            }
            _ => {}
        }
    }

    // ---- outbound requests -------------------------------------------------

    fn on_send(&mut self, node: NodeId, transport: TransportKind, payload: Vec<u8>) {
        let active = self
            .nodes
            .get(&node)
            .and_then(|state| state.lane(transport).active);
        match active {
            Some(id) => self.send_on_channel(id, payload),
            None => self.queue_or_dial(node, transport, Some(payload)),
        }
    }

    fn on_connect_requested(&mut self, node: NodeId, transport: TransportKind) {
        let connected = self
            .nodes
            .get(&node)
            .and_then(|state| state.lane(transport).active)
            .is_some();
        if !connected {
            self.queue_or_dial(node, transport, None);
        }
    }

    /// No active channel for the lane: join the pending connect if one is
    /// in flight, otherwise start one.
    fn queue_or_dial(&mut self, node: NodeId, transport: TransportKind, payload: Option<Vec<u8>>) {
        let has_pending = self
            .nodes
            .get(&node)
            .map_or(false, |state| state.pending(transport).is_some());
        if has_pending {
            if let Some(payload) = payload {
                self.queue_message(&node, transport, payload);
            }
            return;
        }
        match transport {
            TransportKind::Stream => {
                let endpoint = node.endpoint().clone();
                self.dial(node, transport, endpoint, payload);
            }
            TransportKind::Datagram => match self.datagram_cache.get(&node).cloned() {
                Some(endpoint) => self.dial(node, transport, endpoint, payload),
                None => self.park_datagram(node, payload),
            },
        }
    }

    fn queue_message(&mut self, node: &NodeId, transport: TransportKind, payload: Vec<u8>) {
        let limit = self.config.max_queue_size;
        let full = {
            let Some(pending) = self
                .nodes
                .get_mut(node)
                .and_then(|state| state.pending_mut(transport).as_mut())
            else {
                return;
            };
            if pending.queue.len() >= limit {
                true
            } else {
                pending.queue.push(payload);
                false
            }
        };
        if full {
            tracing::warn!(%node, %transport, limit, "pending queue full, dropping message");
            self.shared.borrow_mut().metrics.record_message_dropped();
        }
    }

    fn dial(
        &mut self,
        node: NodeId,
        transport: TransportKind,
        endpoint: SocketEndpoint,
        payload: Option<Vec<u8>>,
    ) {
        tracing::debug!(%node, %transport, %endpoint, "dialing");
        let abort = self.spawn_dial(node.clone(), transport, endpoint);
        let mut pending = PendingConnect::dialing(abort);
        if let Some(payload) = payload {
            pending.queue.push(payload);
        }
        let state = self.nodes.entry(node.clone()).or_default();
        *state.pending_mut(transport) = Some(pending);
        self.shared.borrow_mut().metrics.record_connect_attempt();
        self.emit(node, transport, StatusKind::Requested);
    }

    /// A datagram request arrived before the peer's datagram endpoint is
    /// known. Park it; the stream handshake will release it.
    fn park_datagram(&mut self, node: NodeId, payload: Option<Vec<u8>>) {
        tracing::debug!(%node, "datagram endpoint unknown, parking request behind stream handshake");
        {
            let state = self.nodes.entry(node.clone()).or_default();
            let mut pending = PendingConnect::parked();
            if let Some(payload) = payload {
                pending.queue.push(payload);
            }
            state.pending_datagram = Some(pending);
        }
        self.emit(node.clone(), TransportKind::Datagram, StatusKind::Requested);

        let needs_stream = self.nodes.get(&node).map_or(true, |state| {
            state.stream.members.is_empty() && state.pending_stream.is_none()
        });
        if needs_stream {
            let endpoint = node.endpoint().clone();
            self.dial(node, TransportKind::Stream, endpoint, None);
        }
    }

    fn spawn_dial(
        &self,
        node: NodeId,
        transport: TransportKind,
        endpoint: SocketEndpoint,
    ) -> AbortHandle {
        match transport {
            TransportKind::Stream => {
                self.spawn_dial_on(self.providers.stream().clone(), node, transport, endpoint)
            }
            TransportKind::Datagram => {
                self.spawn_dial_on(self.providers.datagram().clone(), node, transport, endpoint)
            }
        }
    }

    fn spawn_dial_on<C: TransportConnector>(
        &self,
        connector: C,
        node: NodeId,
        transport: TransportKind,
        endpoint: SocketEndpoint,
    ) -> AbortHandle {
        let time = self.providers.time().clone();
        let tasks = self.providers.task().clone();
        let events = self.events_tx.clone();
        let ids = self.ids.clone();
        let wire = self.config.wire;
        let deadline = self.config.connect_timeout;
        let name = format!("connect-{transport}-{node}");
        let task = self.providers.task().spawn_task(&name, async move {
            let outcome = match time.timeout(deadline, connector.connect(&endpoint)).await {
                Ok(Ok(conn)) => Ok(spawn_link(
                    &tasks,
                    ids.next_id(),
                    transport,
                    conn,
                    wire,
                    events.clone(),
                )),
                Ok(Err(error)) => Err(NetError::Io(error)),
                Err(_) => Err(NetError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                ))),
            };
            let _ = events.send(RegistryEvent::ConnectFinished {
                node,
                transport,
                outcome,
            });
        });
        task.abort_handle()
    }

    // ---- connect completions ----------------------------------------------

    fn on_connect_finished(
        &mut self,
        node: NodeId,
        transport: TransportKind,
        outcome: Result<NewLink, NetError>,
    ) {
        let pending = self
            .nodes
            .get_mut(&node)
            .and_then(|state| state.pending_mut(transport).take());
        match outcome {
            Ok(link) => {
                let Some(pending) = pending else {
                    // The pending entry was cleared while the dial was in
                    // flight (cascade or racing completion). Nothing wants
                    // this connection anymore.
                    tracing::debug!(channel = %link.handle.id, %node, "orphaned connect completion, closing");
                    link.handle.send(LinkCommand::Close);
                    return;
                };
                self.register_outbound(node, transport, link, pending.queue);
            }
            Err(error) => self.connect_failed(node, transport, error, pending),
        }
    }

    fn register_outbound(
        &mut self,
        node: NodeId,
        transport: TransportKind,
        link: NewLink,
        queue: Vec<Vec<u8>>,
    ) {
        let id = link.handle.id;
        let remote = link.handle.remote.clone();
        let now = self.providers.time().now();
        tracing::info!(%node, %transport, channel = %id, %remote, "connected");
        {
            let mut shared = self.shared.borrow_mut();
            shared.metrics.record_connect_success();
            shared.metrics.record_channel_opened();
        }
        self.bind_endpoint(remote, node.clone());
        self.channels.insert(
            id,
            ChannelRecord {
                handle: link.handle,
                task: link.task,
                state: ChannelState::Open,
                node: Some(node.clone()),
                opened_at: now,
            },
        );
        self.nodes
            .entry(node.clone())
            .or_default()
            .lane_mut(transport)
            .members
            .insert(id);
        // A fresh outbound channel takes over routing; if it duplicates an
        // existing one, the next inbound traffic resolves the race.
        self.set_active(&node, transport, Some(id));
        // Identify ourselves and advertise our datagram listener.
        self.send_control(
            id,
            control::disambiguate(self.local.clone(), self.datagram_local.clone(), false),
        );
        self.emit(node.clone(), transport, StatusKind::Established);
        self.flush_queue(id, node, transport, queue);
    }

    fn flush_queue(
        &mut self,
        id: ChannelId,
        node: NodeId,
        transport: TransportKind,
        queue: Vec<Vec<u8>>,
    ) {
        let flushed = queue.len();
        for payload in queue {
            self.send_on_channel(id, payload);
        }
        if flushed > 0 {
            tracing::debug!(%node, %transport, flushed, "flushed queued messages");
        }
        self.emit(node, transport, StatusKind::SendDelayed);
    }

    fn connect_failed(
        &mut self,
        node: NodeId,
        transport: TransportKind,
        error: NetError,
        pending: Option<PendingConnect>,
    ) {
        tracing::warn!(%node, %transport, %error, "connect failed");
        let queue = pending.map(|pending| pending.queue).unwrap_or_default();
        // An inbound channel may have shown up while we were dialing; if
        // so the node is reachable after all and the queue rides on it.
        let salvage = self
            .nodes
            .get(&node)
            .and_then(|state| state.lane(transport).active);
        match salvage {
            Some(active) => {
                self.shared.borrow_mut().metrics.record_connect_failure();
                for payload in queue {
                    self.send_on_channel(active, payload);
                }
                self.emit(node, transport, StatusKind::SendDelayed);
            }
            None => {
                {
                    let mut shared = self.shared.borrow_mut();
                    shared.metrics.record_connect_failure();
                    for _ in &queue {
                        shared.metrics.record_message_dropped();
                    }
                }
                self.emit(node.clone(), transport, StatusKind::Dropped);
                self.emit(node.clone(), transport, StatusKind::DropDelayed);
                if transport == TransportKind::Stream {
                    self.abandon_parked_datagram(&node);
                }
                self.prune_node(&node);
            }
        }
    }

    /// A parked datagram request cannot outlive the stream bootstrap that
    /// was supposed to release it.
    fn abandon_parked_datagram(&mut self, node: &NodeId) {
        let queue = {
            let Some(state) = self.nodes.get_mut(node) else {
                return;
            };
            if !state.stream.members.is_empty() {
                return;
            }
            let parked = state
                .pending_datagram
                .as_ref()
                .map_or(false, |pending| pending.is_parked());
            if !parked {
                return;
            }
            match state.pending_datagram.take() {
                Some(pending) => pending.queue,
                None => return,
            }
        };
        tracing::debug!(%node, "stream bootstrap failed, abandoning parked datagram request");
        {
            let mut shared = self.shared.borrow_mut();
            for _ in &queue {
                shared.metrics.record_message_dropped();
            }
        }
        self.emit(node.clone(), TransportKind::Datagram, StatusKind::Dropped);
        self.emit(node.clone(), TransportKind::Datagram, StatusKind::DropDelayed);
    }

    // ---- inbound channels --------------------------------------------------

    fn on_inbound(&mut self, link: NewLink) {
        let id = link.handle.id;
        let now = self.providers.time().now();
        tracing::debug!(
            channel = %id,
            transport = %link.handle.transport,
            remote = %link.handle.remote,
            "accepted connection, awaiting identification"
        );
        self.shared.borrow_mut().metrics.record_channel_opened();
        self.channels.insert(
            id,
            ChannelRecord {
                handle: link.handle,
                task: link.task,
                state: ChannelState::Open,
                node: None,
                opened_at: now,
            },
        );
    }

    // ---- inbound frames ----------------------------------------------------

    fn on_frame(&mut self, id: ChannelId, kind: u8, payload: Vec<u8>) {
        if !self.channels.contains_key(&id) {
            tracing::trace!(channel = %id, "frame for unknown channel, dropping");
            return;
        }
        let Some(kind) = FrameKind::from_byte(kind) else {
            tracing::warn!(channel = %id, kind, "unknown frame kind, skipping");
            return;
        };
        if kind == FrameKind::Data {
            self.on_data(id, payload);
            return;
        }
        let message = match ControlMessage::decode(&self.codec, kind, &payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(channel = %id, %error, "malformed control frame, closing channel");
                self.close_channel(id);
                return;
            }
        };
        match message {
            ControlMessage::Disambiguate {
                source,
                datagram_endpoint,
                is_reply,
            } => self.on_disambiguate(id, source, datagram_endpoint, is_reply),
            ControlMessage::CheckActive { source } => self.on_check_active(id, source),
            ControlMessage::CloseRequest { source } => self.on_close_request(id, source),
            ControlMessage::Closed { source } => self.on_closed(id, source),
        }
    }

    fn on_data(&mut self, id: ChannelId, payload: Vec<u8>) {
        let Some(record) = self.channels.get(&id) else {
            return;
        };
        let Some(node) = record.node.clone() else {
            tracing::warn!(channel = %id, "data on unidentified channel, dropping");
            self.shared.borrow_mut().metrics.record_message_dropped();
            return;
        };
        let transport = record.handle.transport;
        self.shared.borrow_mut().metrics.record_message_received();
        let _ = self.incoming_tx.send(IncomingMessage {
            source: node.clone(),
            transport,
            payload,
        });
        self.observe_traffic(id, node, transport);
    }

    /// Traffic on a non-active channel means both sides dialed at once:
    /// resolve the duplicates now, deterministically.
    fn observe_traffic(&mut self, id: ChannelId, node: NodeId, transport: TransportKind) {
        let active = self
            .nodes
            .get(&node)
            .and_then(|state| state.lane(transport).active);
        match active {
            Some(current) if current == id => {}
            Some(_) => self.resolve_duplicates(node, transport),
            None => {
                let open = self
                    .channels
                    .get(&id)
                    .map_or(false, |record| record.state == ChannelState::Open);
                if open {
                    self.set_active(&node, transport, Some(id));
                }
            }
        }
    }

    fn resolve_duplicates(&mut self, node: NodeId, transport: TransportKind) {
        let (candidates, winner) = {
            let Some(state) = self.nodes.get(&node) else {
                return;
            };
            let lane = state.lane(transport);
            let candidates: Vec<ChannelId> = lane
                .candidates(&self.channels)
                .map(|record| record.handle.id)
                .collect();
            let winner = lane.min_ranked(&self.channels);
            (candidates, winner)
        };
        if candidates.len() <= 1 {
            // Lost a duplicate race against a channel that is already
            // gone. Ask the survivor to verify instead of closing
            // anything.
            if let Some(&only) = candidates.first() {
                tracing::debug!(%node, %transport, channel = %only, "stale duplicate signal, verifying the remaining channel");
                self.send_control(
                    only,
                    ControlMessage::CheckActive {
                        source: self.local.clone(),
                    },
                );
            }
            return;
        }
        let Some(winner) = winner else {
            return;
        };
        let losers: Vec<ChannelId> = candidates.into_iter().filter(|&id| id != winner).collect();
        tracing::debug!(
            %node,
            %transport,
            winner = %winner,
            duplicates = losers.len(),
            "resolving duplicate channels"
        );
        self.set_active(&node, transport, Some(winner));
        for loser in losers {
            if let Some(record) = self.channels.get_mut(&loser) {
                record.state = ChannelState::Closing;
            }
            self.send_control(
                loser,
                ControlMessage::CloseRequest {
                    source: self.local.clone(),
                },
            );
            self.shared.borrow_mut().metrics.record_duplicate_resolved();
        }
    }

    // ---- control handlers --------------------------------------------------

    fn on_disambiguate(
        &mut self,
        id: ChannelId,
        source: NodeId,
        datagram_endpoint: SocketEndpoint,
        is_reply: bool,
    ) {
        let Some(record) = self.channels.get(&id) else {
            return;
        };
        let conflict = record
            .node
            .as_ref()
            .map_or(false, |bound| bound != &source);
        let transport = record.handle.transport;
        let remote = record.handle.remote.clone();
        let newly_identified = record.node.is_none();
        if conflict {
            tracing::warn!(
                channel = %id,
                claimed = %source,
                "handshake contradicts existing identity, closing channel"
            );
            self.close_channel(id);
            return;
        }

        if newly_identified {
            if let Some(record) = self.channels.get_mut(&id) {
                record.node = Some(source.clone());
            }
            self.bind_endpoint(remote, source.clone());
            let designate = {
                let state = self.nodes.entry(source.clone()).or_default();
                state.lane_mut(transport).members.insert(id);
                state.lane(transport).active.is_none()
            };
            if designate {
                self.set_active(&source, transport, Some(id));
            }
            tracing::debug!(channel = %id, node = %source, %transport, "channel identified");
            self.emit(source.clone(), transport, StatusKind::Established);
        }

        // The advertised endpoint is only trustworthy while a stream
        // channel to the node exists; without one it would go stale
        // unnoticed.
        let has_stream = self
            .nodes
            .get(&source)
            .map_or(false, |state| !state.stream.members.is_empty());
        if has_stream {
            self.datagram_cache.insert(source.clone(), datagram_endpoint);
            self.flush_parked_datagram(&source);
        }

        if !is_reply {
            self.send_control(
                id,
                control::disambiguate(self.local.clone(), self.datagram_local.clone(), true),
            );
        }
    }

    /// The handshake revealed a datagram endpoint; release any parked
    /// request for it.
    fn flush_parked_datagram(&mut self, node: &NodeId) {
        let parked = self
            .nodes
            .get(node)
            .and_then(|state| state.pending_datagram.as_ref())
            .map_or(false, |pending| pending.is_parked());
        if !parked {
            return;
        }
        let Some(endpoint) = self.datagram_cache.get(node).cloned() else {
            return;
        };
        let Some(queue) = self
            .nodes
            .get_mut(node)
            .and_then(|state| state.pending_datagram.take())
            .map(|pending| pending.queue)
        else {
            return;
        };
        tracing::debug!(%node, %endpoint, "datagram endpoint learned, resuming parked connect");
        let abort = self.spawn_dial(node.clone(), TransportKind::Datagram, endpoint);
        let state = self.nodes.entry(node.clone()).or_default();
        state.pending_datagram = Some(PendingConnect {
            state: PendingState::Dialing { abort },
            queue,
        });
        self.shared.borrow_mut().metrics.record_connect_attempt();
    }

    /// The peer vouches for the carrying channel: it is the one the peer
    /// routes through, or the only one it has left. A non-active carrier
    /// takes over the active designation; a carrier we already route
    /// through means both ends agree, and every other member is a
    /// duplicate the peer no longer wants.
    fn on_check_active(&mut self, id: ChannelId, source: NodeId) {
        let Some(record) = self.channels.get_mut(&id) else {
            return;
        };
        let Some(node) = record.node.clone() else {
            tracing::debug!(channel = %id, %source, "check-active on unidentified channel, ignoring");
            return;
        };
        let transport = record.handle.transport;
        if record.state == ChannelState::Closing {
            tracing::debug!(channel = %id, %node, "peer vetoed close, keeping channel as member");
            record.state = ChannelState::Open;
        }
        let active = self
            .nodes
            .get(&node)
            .and_then(|state| state.lane(transport).active);
        if active != Some(id) {
            tracing::debug!(channel = %id, %node, %transport, "peer vouched for this channel, routing through it");
            self.set_active(&node, transport, Some(id));
            return;
        }
        let duplicates: Vec<ChannelId> = self
            .nodes
            .get(&node)
            .map(|state| {
                state
                    .lane(transport)
                    .candidates(&self.channels)
                    .map(|record| record.handle.id)
                    .filter(|&other| other != id)
                    .collect()
            })
            .unwrap_or_default();
        for other in duplicates {
            tracing::warn!(
                channel = %other,
                %node,
                %transport,
                "closing duplicate channel, both ends route elsewhere"
            );
            if let Some(record) = self.channels.get_mut(&other) {
                record.state = ChannelState::Closing;
            }
            self.send_control(
                other,
                ControlMessage::CloseRequest {
                    source: self.local.clone(),
                },
            );
            self.shared.borrow_mut().metrics.record_duplicate_resolved();
        }
    }

    fn on_close_request(&mut self, id: ChannelId, source: NodeId) {
        let Some(record) = self.channels.get(&id) else {
            return;
        };
        let node = record.node.clone();
        let transport = record.handle.transport;
        if let Some(node) = node {
            let members = self
                .nodes
                .get(&node)
                .map_or(0, |state| state.lane(transport).members.len());
            if members < 2 {
                // The requester is working off stale duplicate
                // information; this is the only channel left and closing
                // it would cut the node off. Keep it and say so.
                tracing::warn!(channel = %id, %node, "refusing close request for the only remaining channel");
                if let Some(record) = self.channels.get_mut(&id) {
                    record.state = ChannelState::Open;
                }
                self.set_active(&node, transport, Some(id));
                self.send_control(
                    id,
                    ControlMessage::CheckActive {
                        source: self.local.clone(),
                    },
                );
                return;
            }
            tracing::debug!(channel = %id, %node, %source, "agreeing to close duplicate channel");
        } else {
            tracing::debug!(channel = %id, %source, "close request for unidentified channel, agreeing");
        }
        self.send_control(
            id,
            ControlMessage::Closed {
                source: self.local.clone(),
            },
        );
        // The Closed reply and the connection shutdown share the command
        // queue, so the reply is flushed before the FIN.
        self.close_channel(id);
    }

    fn on_closed(&mut self, id: ChannelId, source: NodeId) {
        tracing::debug!(channel = %id, %source, "peer confirmed close");
        self.close_channel(id);
    }

    // ---- channel teardown --------------------------------------------------

    /// Ask the link to flush and close, then drop it from the registry.
    fn close_channel(&mut self, id: ChannelId) {
        if let Some(record) = self.channels.get(&id) {
            record.handle.send(LinkCommand::Close);
        }
        self.unregister(id);
    }

    fn on_link_closed(&mut self, id: ChannelId) {
        if self.channels.contains_key(&id) {
            tracing::debug!(channel = %id, "connection lost");
            self.unregister(id);
        }
    }

    /// Remove a channel record and repair everything that pointed at it.
    fn unregister(&mut self, id: ChannelId) {
        let Some(record) = self.channels.remove(&id) else {
            return;
        };
        self.shared.borrow_mut().metrics.record_channel_closed();
        self.reverse.remove(&record.handle.remote);
        let Some(node) = record.node else {
            return;
        };
        let transport = record.handle.transport;
        let (was_active, now_empty) = {
            let Some(state) = self.nodes.get_mut(&node) else {
                return;
            };
            let lane = state.lane_mut(transport);
            lane.members.remove(&id);
            let was_active = lane.active == Some(id);
            (was_active, lane.members.is_empty())
        };
        if was_active {
            let next = self
                .nodes
                .get(&node)
                .and_then(|state| state.lane(transport).min_ranked(&self.channels));
            self.set_active(&node, transport, next);
        }
        if now_empty {
            self.emit(node.clone(), transport, StatusKind::Dropped);
            if transport == TransportKind::Stream {
                self.cascade(&node);
            }
        }
        self.prune_node(&node);
    }

    /// The last stream channel to a node is gone: the node is unreachable,
    /// so its datagram lane and cached endpoint go with it.
    fn cascade(&mut self, node: &NodeId) {
        let cache_dropped = self.datagram_cache.remove(node).is_some();
        let members: Vec<ChannelId> = self
            .nodes
            .get(node)
            .map(|state| state.datagram.members.iter().copied().collect())
            .unwrap_or_default();
        for id in &members {
            if let Some(record) = self.channels.remove(id) {
                record.handle.send(LinkCommand::Close);
                self.reverse.remove(&record.handle.remote);
                self.shared.borrow_mut().metrics.record_channel_closed();
                // One notification per casualty, not one per lane.
                self.emit(node.clone(), TransportKind::Datagram, StatusKind::Dropped);
            }
        }
        if let Some(state) = self.nodes.get_mut(node) {
            state.datagram.members.clear();
            state.datagram.active = None;
        }
        self.shared
            .borrow_mut()
            .actives
            .remove(&(node.clone(), TransportKind::Datagram));
        // In-flight datagram work is doomed too; without a stream channel
        // the endpoint it targets can no longer be trusted.
        let pending = self
            .nodes
            .get_mut(node)
            .and_then(|state| state.pending_datagram.take());
        let had_pending = pending.is_some();
        if let Some(pending) = pending {
            if let PendingState::Dialing { abort } = &pending.state {
                abort.abort();
            }
            let mut shared = self.shared.borrow_mut();
            for _ in &pending.queue {
                shared.metrics.record_message_dropped();
            }
        }
        if !members.is_empty() || had_pending || cache_dropped {
            tracing::info!(
                %node,
                closed = members.len(),
                "stream lane lost, cascading datagram teardown"
            );
        }
        if had_pending {
            self.emit(node.clone(), TransportKind::Datagram, StatusKind::DropDelayed);
        }
    }

    // ---- sweep and shutdown ------------------------------------------------

    /// Evict channels that never completed the identification handshake.
    fn on_sweep(&mut self) {
        let now = self.providers.time().now();
        let deadline = self.config.identify_timeout;
        let expired: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|record| {
                record.node.is_none() && now.saturating_sub(record.opened_at) >= deadline
            })
            .map(|record| record.handle.id)
            .collect();
        for id in expired {
            tracing::warn!(channel = %id, "evicting channel that never identified itself");
            self.close_channel(id);
        }
        self.publish();
        let shared = self.shared.borrow();
        tracing::debug!(
            nodes = shared.stats.known_nodes,
            channels = shared.stats.open_channels,
            pending = shared.stats.pending_connects,
            parked = shared.stats.deferred_datagrams,
            queued = shared.stats.queued_messages,
            "registry sweep"
        );
    }

    /// Ordered teardown: stop intake, cancel dials, close every channel,
    /// wait for the link tasks, bounded by the configured timeout.
    async fn shutdown(&mut self) {
        tracing::info!(node = %self.local, "registry shutting down");
        for aux in &self.aux {
            aux.abort();
        }
        self.shared.borrow_mut().actives.clear();
        let mut dropped = 0usize;
        for state in self.nodes.values_mut() {
            state.stream.active = None;
            state.datagram.active = None;
            for pending in [state.pending_stream.take(), state.pending_datagram.take()]
                .into_iter()
                .flatten()
            {
                if let PendingState::Dialing { abort } = &pending.state {
                    abort.abort();
                }
                dropped += pending.queue.len();
            }
        }
        {
            let mut shared = self.shared.borrow_mut();
            for _ in 0..dropped {
                shared.metrics.record_message_dropped();
            }
        }
        let mut waiters = Vec::new();
        let mut aborts = Vec::new();
        for (_, record) in self.channels.drain() {
            record.handle.send(LinkCommand::Close);
            aborts.push(record.task.abort_handle());
            waiters.push(record.task);
        }
        {
            let mut shared = self.shared.borrow_mut();
            for _ in 0..waiters.len() {
                shared.metrics.record_channel_closed();
            }
        }
        let closing = waiters.len();
        let time = self.providers.time().clone();
        let wait = self.config.shutdown_timeout;
        let outcome = time
            .timeout(wait, async move {
                for task in waiters {
                    let _ = task.await;
                }
            })
            .await;
        if outcome.is_err() {
            tracing::warn!(closing, "shutdown wait timed out, aborting remaining link tasks");
            for abort in aborts {
                abort.abort();
            }
        }
        self.nodes.clear();
        self.reverse.clear();
        self.datagram_cache.clear();
        self.publish();
        tracing::info!(node = %self.local, "registry shut down");
    }

    // ---- shared plumbing ---------------------------------------------------

    fn send_on_channel(&mut self, id: ChannelId, payload: Vec<u8>) {
        let delivered = match self.channels.get(&id) {
            Some(record) => record.handle.send(LinkCommand::Data(payload)),
            None => false,
        };
        let mut shared = self.shared.borrow_mut();
        if delivered {
            shared.metrics.record_message_sent();
        } else {
            tracing::debug!(channel = %id, "channel gone, message dropped");
            shared.metrics.record_message_dropped();
        }
    }

    fn send_control(&self, id: ChannelId, message: ControlMessage) {
        let Some(record) = self.channels.get(&id) else {
            return;
        };
        match message.encode(&self.codec) {
            Ok(payload) => {
                let kind = message.frame_kind();
                if !record.handle.send(LinkCommand::Control(kind, payload)) {
                    tracing::debug!(channel = %id, ?kind, "channel gone, control frame dropped");
                }
            }
            Err(error) => {
                tracing::warn!(channel = %id, %error, "control frame failed to encode");
            }
        }
    }

    /// Point the lane's active designation at `id` (or clear it) and
    /// mirror the change for the facade.
    fn set_active(&mut self, node: &NodeId, transport: TransportKind, id: Option<ChannelId>) {
        let remote = id
            .and_then(|id| self.channels.get(&id))
            .map(|record| record.handle.remote.clone());
        if let Some(state) = self.nodes.get_mut(node) {
            state.lane_mut(transport).active = id;
        }
        let mut shared = self.shared.borrow_mut();
        match remote {
            Some(remote) => {
                shared.actives.insert((node.clone(), transport), remote);
            }
            None => {
                shared.actives.remove(&(node.clone(), transport));
            }
        }
    }

    fn bind_endpoint(&mut self, remote: SocketEndpoint, node: NodeId) {
        if let Some(previous) = self.reverse.insert(remote.clone(), node.clone()) {
            if previous != node {
                tracing::warn!(%remote, %previous, now = %node, "remote endpoint rebound to a different node");
            }
        }
    }

    fn prune_node(&mut self, node: &NodeId) {
        if let Some(state) = self.nodes.get(node) {
            if state.is_empty() {
                self.nodes.remove(node);
            }
        }
    }

    fn emit(&self, node: NodeId, transport: TransportKind, kind: StatusKind) {
        let _ = self.status_tx.send(StatusEvent {
            node,
            transport,
            kind,
        });
    }

    fn publish(&self) {
        let mut shared = self.shared.borrow_mut();
        shared.stats = RegistryStats {
            known_nodes: self
                .nodes
                .values()
                .filter(|state| {
                    !state.stream.members.is_empty() || !state.datagram.members.is_empty()
                })
                .count(),
            open_channels: self.channels.len(),
            pending_connects: self
                .nodes
                .values()
                .flat_map(|state| [state.pending(TransportKind::Stream), state.pending(TransportKind::Datagram)])
                .flatten()
                .filter(|pending| !pending.is_parked())
                .count(),
            deferred_datagrams: self
                .nodes
                .values()
                .filter(|state| {
                    state
                        .pending_datagram
                        .as_ref()
                        .map_or(false, |pending| pending.is_parked())
                })
                .count(),
            queued_messages: self
                .nodes
                .values()
                .flat_map(|state| [state.pending_stream.as_ref(), state.pending_datagram.as_ref()])
                .flatten()
                .map(|pending| pending.queue.len())
                .sum(),
            identified_endpoints: self.reverse.len(),
        };
    }
}
