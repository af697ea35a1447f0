//! # hawser-core
//!
//! Environment providers and shared building blocks for the hawser
//! networking crates.
//!
//! The registry in `hawser-net` never touches sockets, clocks or spawners
//! directly. It goes through the provider traits defined here, so the same
//! code runs against real TCP in production and against an in-memory
//! network in tests:
//!
//! - [`TransportConnector`] / [`TransportListener`]: bind, dial, accept
//! - [`TimeProvider`]: clock, sleeps and deadlines
//! - [`TaskProvider`]: spawning named tasks on the current thread
//! - [`Providers`]: the three of them bundled into one type parameter,
//!   with a stream lane and a datagram lane
//!
//! Shared types live here too: [`SocketEndpoint`] and [`NodeId`] for
//! addressing, [`TransportKind`] to tag which lane a channel belongs to,
//! and the [`MessageCodec`] trait with its [`JsonCodec`] default.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod network;
mod providers;
mod sim;
mod task;
mod time;
mod types;

// Codec exports
pub use codec::{CodecError, JsonCodec, MessageCodec};

// Provider trait exports
pub use network::{Connected, TcpNet, TcpNetListener, TransportConnector, TransportListener};
pub use providers::{Providers, SimProviders, TokioProviders};
pub use sim::{SimListener, SimNet};
pub use task::{TaskProvider, TokioTask};
pub use time::{TimeError, TimeProvider, TokioTime};

// Core type exports
pub use types::{EndpointParseError, NodeId, SocketEndpoint, TransportKind};
