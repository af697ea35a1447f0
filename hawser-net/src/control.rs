//! Control messages exchanged between registry nodes.
//!
//! Control frames ride the same connections as data frames, so a handshake
//! and the traffic that follows it stay ordered. Each message maps onto one
//! [`FrameKind`]; the payload is the codec-encoded message body.

use hawser_core::{MessageCodec, NodeId, SocketEndpoint};
use serde::{Deserialize, Serialize};

use crate::error::NetError;
use crate::wire::FrameKind;

/// Registry-to-registry control traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Identification handshake.
    ///
    /// Sent by the dialing side as soon as an outbound connection is up, on
    /// both lanes. It binds the connection to the sender's stable identity
    /// and, on the stream lane, advertises where the sender's datagram
    /// listener lives. The receiving side answers with `is_reply: true`
    /// unless this message is itself a reply.
    Disambiguate {
        /// Stable identity of the sender.
        source: NodeId,
        /// Endpoint of the sender's datagram listener.
        datagram_endpoint: SocketEndpoint,
        /// True when answering a handshake rather than initiating one.
        is_reply: bool,
    },

    /// Answer to a close request for a channel the sender still uses.
    ///
    /// Receiving this cancels the close: the requester downgrades the
    /// channel back to a plain member instead of dropping it.
    CheckActive {
        /// Stable identity of the sender.
        source: NodeId,
    },

    /// Ask the peer to confirm closing this channel.
    CloseRequest {
        /// Stable identity of the sender.
        source: NodeId,
    },

    /// Confirmation that the peer has stopped using this channel.
    Closed {
        /// Stable identity of the sender.
        source: NodeId,
    },
}

impl ControlMessage {
    /// The frame kind this message travels under.
    pub fn frame_kind(&self) -> FrameKind {
        match self {
            ControlMessage::Disambiguate { .. } => FrameKind::Disambiguate,
            ControlMessage::CheckActive { .. } => FrameKind::CheckActive,
            ControlMessage::CloseRequest { .. } => FrameKind::CloseRequest,
            ControlMessage::Closed { .. } => FrameKind::Closed,
        }
    }

    /// Encode this message into a frame payload.
    pub fn encode<C: MessageCodec>(&self, codec: &C) -> Result<Vec<u8>, NetError> {
        Ok(codec.encode(self)?)
    }

    /// Decode a control frame payload, checking that the frame kind agrees
    /// with the message inside.
    pub fn decode<C: MessageCodec>(
        codec: &C,
        kind: FrameKind,
        payload: &[u8],
    ) -> Result<Self, NetError> {
        let message: ControlMessage = codec.decode(payload)?;
        if message.frame_kind() != kind {
            return Err(NetError::Protocol {
                detail: format!(
                    "frame kind {:?} carries {:?} message",
                    kind,
                    message.frame_kind()
                ),
            });
        }
        Ok(message)
    }
}

/// Convenience constructor for the handshake, used on every outbound
/// connect and when answering one.
pub(crate) fn disambiguate(
    source: NodeId,
    datagram_endpoint: SocketEndpoint,
    is_reply: bool,
) -> ControlMessage {
    ControlMessage::Disambiguate {
        source,
        datagram_endpoint,
        is_reply,
    }
}
