//! Channel tasks: one task per live connection.
//!
//! A link task owns its connection exclusively. The registry owner talks to
//! it through a command queue (write this frame, close), and the task
//! reports inbound frames and its own death back through the registry event
//! queue. All registry state stays with the owner; a link knows nothing
//! beyond its id and its socket.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use hawser_core::{Connected, SocketEndpoint, TaskProvider, TransportKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::registry::event::RegistryEvent;
use crate::wire::{self, FrameKind, WireConfig, WireError};

/// Identifier for one channel within a registry instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ChannelId(u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic channel id generator, shared by the accept tasks and the owner.
#[derive(Clone, Debug)]
pub(crate) struct ChannelIds {
    next: Rc<Cell<u64>>,
}

impl ChannelIds {
    pub(crate) fn new() -> Self {
        Self {
            next: Rc::new(Cell::new(0)),
        }
    }

    pub(crate) fn next_id(&self) -> ChannelId {
        let id = self.next.get();
        self.next.set(id + 1);
        ChannelId(id)
    }
}

/// Commands the owner sends to a link task.
#[derive(Debug)]
pub(crate) enum LinkCommand {
    /// Write a data frame.
    Data(Vec<u8>),
    /// Write a control frame; the payload is already encoded.
    Control(FrameKind, Vec<u8>),
    /// Flush pending writes, shut the connection down, exit.
    Close,
}

/// Owner-side handle to a live channel.
#[derive(Debug, Clone)]
pub(crate) struct ChannelHandle {
    pub id: ChannelId,
    pub transport: TransportKind,
    pub local: SocketEndpoint,
    pub remote: SocketEndpoint,
    pub(crate) commands: mpsc::UnboundedSender<LinkCommand>,
}

impl ChannelHandle {
    /// Duplicate-resolution rank: the sum of both port numbers.
    ///
    /// Commutative, so both ends of the same connection compute the same
    /// value even though each sees the endpoint pair in opposite order.
    pub(crate) fn rank(&self) -> u32 {
        u32::from(self.local.port) + u32::from(self.remote.port)
    }

    /// Hand a command to the link task. Returns false if the task is gone;
    /// the owner will see a `LinkClosed` for it shortly.
    pub(crate) fn send(&self, command: LinkCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// A freshly spawned link, ready to be registered by the owner.
#[derive(Debug)]
pub(crate) struct NewLink {
    pub handle: ChannelHandle,
    pub task: tokio::task::JoinHandle<()>,
}

/// Spawn a link task for an established connection.
pub(crate) fn spawn_link<S, T>(
    tasks: &T,
    id: ChannelId,
    transport: TransportKind,
    conn: Connected<S>,
    wire: WireConfig,
    events: mpsc::UnboundedSender<RegistryEvent>,
) -> NewLink
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
    T: TaskProvider,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = ChannelHandle {
        id,
        transport,
        local: conn.local,
        remote: conn.remote,
        commands: commands_tx,
    };
    let task = tasks.spawn_task(
        &format!("link-{id}"),
        link_task(id, conn.stream, wire, commands_rx, events),
    );
    NewLink { handle, task }
}

/// The per-connection loop: commands out, frames in, until either side
/// gives up. Always reports `LinkClosed` on the way out.
async fn link_task<S>(
    id: ChannelId,
    mut stream: S,
    wire: WireConfig,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<RegistryEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let mut inbound: Vec<u8> = Vec::with_capacity(4096);
    let mut scratch = vec![0u8; 4096];

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Data(payload)) => {
                    if !write_frame(&mut stream, id, FrameKind::Data, &payload, wire).await {
                        break;
                    }
                }
                Some(LinkCommand::Control(kind, payload)) => {
                    if !write_frame(&mut stream, id, kind, &payload, wire).await {
                        break;
                    }
                }
                Some(LinkCommand::Close) | None => {
                    tracing::debug!(channel = %id, "closing connection");
                    let _ = stream.shutdown().await;
                    break;
                }
            },
            result = stream.read(&mut scratch) => match result {
                Ok(0) => {
                    tracing::debug!(channel = %id, "peer closed connection");
                    break;
                }
                Ok(n) => {
                    inbound.extend_from_slice(&scratch[..n]);
                    if let Err(error) = drain_frames(id, &mut inbound, wire, &events) {
                        tracing::warn!(channel = %id, %error, "corrupt frame, tearing channel down");
                        break;
                    }
                }
                Err(error) => {
                    tracing::debug!(channel = %id, %error, "read failed");
                    break;
                }
            },
        }
    }

    let _ = events.send(RegistryEvent::LinkClosed { id });
}

/// Encode and write one frame. Returns false when the connection is dead.
async fn write_frame<S>(
    stream: &mut S,
    id: ChannelId,
    kind: FrameKind,
    payload: &[u8],
    wire: WireConfig,
) -> bool
where
    S: AsyncWrite + Unpin,
{
    let frame = match wire::encode_frame(kind, payload, wire) {
        Ok(frame) => frame,
        Err(error) => {
            // oversized frame: drop it, keep the channel
            tracing::warn!(channel = %id, %error, "dropping unencodable frame");
            return true;
        }
    };
    match stream.write_all(&frame).await {
        Ok(()) => true,
        Err(error) => {
            tracing::debug!(channel = %id, %error, "write failed");
            false
        }
    }
}

/// Parse every complete frame out of the inbound buffer and forward them
/// to the owner. A malformed frame poisons the whole buffer, so the caller
/// tears the channel down on error.
fn drain_frames(
    id: ChannelId,
    inbound: &mut Vec<u8>,
    wire: WireConfig,
    events: &mpsc::UnboundedSender<RegistryEvent>,
) -> Result<(), WireError> {
    while let Some(frame) = wire::try_decode_frame(inbound, wire)? {
        inbound.drain(..frame.consumed);
        let _ = events.send(RegistryEvent::FrameReceived {
            id,
            kind: frame.kind,
            payload: frame.payload,
        });
    }
    Ok(())
}
