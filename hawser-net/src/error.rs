//! Error types for the registry layer.

use hawser_core::CodecError;

use crate::wire::WireError;

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Underlying socket operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding or decoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Control message serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Peer sent a frame that violates the control protocol.
    #[error("protocol violation: {detail}")]
    Protocol {
        /// What the peer got wrong.
        detail: String,
    },

    /// The registry has been shut down and no longer accepts work.
    #[error("registry shutting down")]
    ShuttingDown,
}
