//! # hawser-net
//!
//! Dual-transport connection registry with duplicate-channel
//! disambiguation.
//!
//! This crate provides:
//! - **ChannelRegistry**: stable node identities over volatile connections,
//!   with queueing while connects are in flight
//! - **Duplicate resolution**: symmetric dials collapse onto one survivor
//!   both sides pick without coordinating
//! - **Wire format**: length-prefixed frames with CRC32C checksums
//! - **Control protocol**: identification handshake plus a cooperative
//!   close that cannot drop a channel still in use
//! - **Status stream**: per-node, per-lane reachability events

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use hawser_core::{
    CodecError, Connected, EndpointParseError, JsonCodec, MessageCodec, NodeId, Providers,
    SimListener, SimNet, SimProviders, SocketEndpoint, TaskProvider, TcpNet, TcpNetListener,
    TimeError, TimeProvider, TokioProviders, TokioTask, TokioTime, TransportConnector,
    TransportKind, TransportListener,
};

// =============================================================================
// Modules
// =============================================================================

/// Configuration for registry behavior.
pub mod config;

/// Control messages exchanged between registry nodes.
pub mod control;

/// Error types for registry operations.
pub mod error;

mod link;

/// Registry traffic counters.
pub mod metrics;

/// The connection registry itself.
pub mod registry;

/// Connection status events.
pub mod status;

/// Length-prefixed wire format with CRC32C checksums.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Registry exports
pub use registry::{ChannelRegistry, IncomingMessage, IncomingReceiver, RegistryStats};

// Configuration and error exports
pub use config::RegistryConfig;
pub use error::NetError;

// Protocol and status exports
pub use control::ControlMessage;
pub use metrics::RegistryMetrics;
pub use status::{StatusEvent, StatusKind, StatusReceiver};

// Wire format exports
pub use wire::{
    encode_frame, try_decode_frame, FrameHeader, FrameKind, RawFrame, WireConfig, WireError,
    HEADER_SIZE,
};
