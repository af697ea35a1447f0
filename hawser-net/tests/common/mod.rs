//! Shared harness for registry integration tests.
//!
//! Tests run whole registry nodes against an in-memory [`SimNet`] world.
//! For protocol-level scenarios a [`RawPeer`] sits on the far end of a
//! connection and speaks the wire format by hand, which lets a test
//! misbehave in ways a real registry never would.

#![allow(dead_code)]

use std::time::Duration;

use hawser_net::{
    encode_frame, try_decode_frame, ChannelRegistry, Connected, ControlMessage, FrameKind,
    IncomingMessage, IncomingReceiver, JsonCodec, NodeId, RawFrame, RegistryConfig, SimNet,
    SimProviders, SocketEndpoint, StatusKind, StatusReceiver, TransportConnector, TransportKind,
    WireConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Deadline for anything a test waits on.
pub const DEADLINE: Duration = Duration::from_secs(5);

/// Run a future on a current-thread runtime inside a `LocalSet`.
pub fn run_local<F: std::future::Future>(future: F) -> F::Output {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("failed to build runtime");
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(future))
}

/// One registry node plus the streams taken off it.
pub struct TestNode {
    pub registry: ChannelRegistry,
    pub incoming: IncomingReceiver,
    pub status: StatusReceiver,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.registry.local_node().clone()
    }
}

/// Start a registry on `host` with its stream listener at `port` and an
/// assigned datagram port, using the fast local-network config.
pub async fn start_node(world: &SimNet, host: &str, port: u16) -> TestNode {
    start_node_with_config(world, host, port, RegistryConfig::local_network()).await
}

pub async fn start_node_with_config(
    world: &SimNet,
    host: &str,
    port: u16,
    config: RegistryConfig,
) -> TestNode {
    let providers = SimProviders::new(world.host(host));
    let mut registry = ChannelRegistry::bind(
        providers,
        config,
        &SocketEndpoint::new(host, port),
        &SocketEndpoint::new(host, 0),
    )
    .await
    .expect("bind registry");
    let incoming = registry.take_incoming().expect("incoming stream");
    let status = registry.take_status().expect("status stream");
    TestNode {
        registry,
        incoming,
        status,
    }
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(DEADLINE, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    if waited.is_err() {
        panic!("timed out waiting for {what}");
    }
}

/// Consume status events until one matches, skipping everything else.
pub async fn wait_for_status(
    status: &mut StatusReceiver,
    node: &NodeId,
    transport: TransportKind,
    kind: StatusKind,
) {
    let waited = tokio::time::timeout(DEADLINE, async {
        loop {
            match status.recv().await {
                Some(event)
                    if event.node == *node && event.transport == transport && event.kind == kind =>
                {
                    break;
                }
                Some(_) => {}
                None => panic!("status stream closed waiting for {kind:?} on {transport}"),
            }
        }
    })
    .await;
    if waited.is_err() {
        panic!("timed out waiting for status {kind:?} on {transport}");
    }
}

/// Drain everything currently queued on the status stream.
pub fn drain_status(status: &mut StatusReceiver) {
    while status.try_recv().is_some() {}
}

/// Receive the next inbound message, bounded by the deadline.
pub async fn expect_message(incoming: &mut IncomingReceiver) -> IncomingMessage {
    tokio::time::timeout(DEADLINE, incoming.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("incoming stream closed")
}

/// A scripted peer on the far end of one raw connection.
pub struct RawPeer {
    pub stream: DuplexStream,
    /// Our (ephemeral) endpoint of the connection.
    pub local: SocketEndpoint,
    buffer: Vec<u8>,
    codec: JsonCodec,
    wire: WireConfig,
}

impl RawPeer {
    /// Dial `target` on the world as `host` and wrap the connection.
    pub async fn connect(world: &SimNet, host: &str, target: &SocketEndpoint) -> Self {
        let conn = world
            .host(host)
            .connect(target)
            .await
            .expect("raw connect");
        Self::accepted(conn)
    }

    /// Wrap a connection handed out by a raw listener.
    pub fn accepted(conn: Connected<DuplexStream>) -> Self {
        Self {
            stream: conn.stream,
            local: conn.local,
            buffer: Vec::new(),
            codec: JsonCodec,
            wire: WireConfig::default(),
        }
    }

    /// Write one frame.
    pub async fn write_frame(&mut self, kind: FrameKind, payload: &[u8]) {
        let bytes = encode_frame(kind, payload, self.wire).expect("encode frame");
        self.stream.write_all(&bytes).await.expect("write frame");
    }

    /// Write a control message under its own frame kind.
    pub async fn write_control(&mut self, message: &ControlMessage) {
        let payload = message.encode(&self.codec).expect("encode control");
        self.write_frame(message.frame_kind(), &payload).await;
    }

    /// Read the next frame, waiting as needed.
    pub async fn read_frame(&mut self) -> RawFrame {
        tokio::time::timeout(DEADLINE, async {
            loop {
                if let Some(frame) =
                    try_decode_frame(&self.buffer, self.wire).expect("decode frame")
                {
                    self.buffer.drain(..frame.consumed);
                    return frame;
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.expect("read frame");
                if n == 0 {
                    panic!("peer closed the connection while a frame was expected");
                }
                self.buffer.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// Read frames until a control message of the given kind arrives.
    pub async fn read_control(&mut self, kind: FrameKind) -> ControlMessage {
        loop {
            let frame = self.read_frame().await;
            if frame.kind == kind as u8 {
                return ControlMessage::decode(&self.codec, kind, &frame.payload)
                    .expect("decode control");
            }
        }
    }

    /// Identify as `source`, advertising `datagram_endpoint`, and consume
    /// the handshake reply.
    pub async fn handshake(&mut self, source: &NodeId, datagram_endpoint: &SocketEndpoint) {
        self.write_control(&ControlMessage::Disambiguate {
            source: source.clone(),
            datagram_endpoint: datagram_endpoint.clone(),
            is_reply: false,
        })
        .await;
        let reply = self.read_control(FrameKind::Disambiguate).await;
        match reply {
            ControlMessage::Disambiguate { is_reply: true, .. } => {}
            other => panic!("expected a handshake reply, got {other:?}"),
        }
    }

    /// Wait for the registry side to drop the connection.
    pub async fn expect_eof(&mut self) {
        tokio::time::timeout(DEADLINE, async {
            let mut chunk = [0u8; 4096];
            loop {
                let n = self.stream.read(&mut chunk).await.expect("read until eof");
                if n == 0 {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for the connection to close");
    }
}
