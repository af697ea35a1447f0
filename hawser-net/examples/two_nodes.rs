//! Two-Node Example: dual-transport messaging over real TCP.
//!
//! Two registry nodes talk to each other over **real TCP sockets**. The
//! second node greets the first over the stream lane and pushes a bulk
//! payload over the datagram lane; the first node answers on both. The
//! datagram channel needs no configuration on either side: its endpoint
//! travels inside the stream handshake.
//!
//! Run as two separate processes:
//!
//! ```bash
//! # Terminal 1 - Start the first node
//! cargo run --example two_nodes -- first
//!
//! # Terminal 2 - Start the second node
//! cargo run --example two_nodes -- second
//! ```

use std::env;
use std::time::Duration;

use hawser_net::{
    ChannelRegistry, IncomingReceiver, NodeId, RegistryConfig, SocketEndpoint, StatusReceiver,
    TokioProviders, TransportKind,
};

// ============================================================================
// Configuration
// ============================================================================

const FIRST_ADDR: &str = "127.0.0.1:4600";
const SECOND_ADDR: &str = "127.0.0.1:4601";

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Helpers
// ============================================================================

/// Bind a registry on `addr` with an assigned datagram port.
async fn start_registry(addr: &str) -> Result<ChannelRegistry, Box<dyn std::error::Error>> {
    let stream_endpoint = NodeId::parse(addr)?.endpoint().clone();
    let datagram_endpoint = SocketEndpoint::new(stream_endpoint.host.clone(), 0);
    let registry = ChannelRegistry::bind(
        TokioProviders::new(),
        RegistryConfig::default(),
        &stream_endpoint,
        &datagram_endpoint,
    )
    .await?;
    println!(
        "Node {} up (datagram lane on {})\n",
        registry.local_node(),
        registry.datagram_endpoint()
    );
    Ok(registry)
}

/// Print channel status events as they happen.
fn spawn_status_printer(mut status: StatusReceiver) {
    tokio::task::spawn_local(async move {
        while let Some(event) = status.recv().await {
            println!(
                "  [status] {} lane to {}: {:?}",
                event.transport, event.node, event.kind
            );
        }
    });
}

/// Wait for one message and print it.
async fn recv_one(
    incoming: &mut IncomingReceiver,
) -> Result<(NodeId, TransportKind), Box<dyn std::error::Error>> {
    let message = tokio::time::timeout(RECV_TIMEOUT, incoming.recv())
        .await
        .map_err(|_| "timed out waiting for a message")?
        .ok_or("registry closed")?;
    println!(
        "Received over {} from {}: {:?}",
        message.transport,
        message.source,
        String::from_utf8_lossy(&message.payload)
    );
    Ok((message.source, message.transport))
}

// ============================================================================
// First node: waits for the greeting, answers on both lanes
// ============================================================================

async fn run_first() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== First Node ===\n");

    let mut registry = start_registry(FIRST_ADDR).await?;
    let mut incoming = registry.take_incoming().ok_or("incoming stream taken")?;
    let status = registry.take_status().ok_or("status stream taken")?;
    spawn_status_printer(status);

    println!("Waiting for the second node...\n");
    let (peer, _) = recv_one(&mut incoming).await?;

    // reply over the channel the greeting arrived on, then over the
    // datagram lane the handshake advertised
    registry.send(&peer, TransportKind::Stream, b"right back at you".to_vec())?;
    registry.send(&peer, TransportKind::Datagram, vec![0u8; 1024])?;

    // second message is the peer's bulk payload
    recv_one(&mut incoming).await?;

    let stats = registry.stats();
    println!(
        "\nOpen channels: {} (nodes known: {})",
        stats.open_channels, stats.known_nodes
    );
    println!("Shutting down.");
    registry.shutdown().await;
    Ok(())
}

// ============================================================================
// Second node: initiates on both lanes
// ============================================================================

async fn run_second() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Second Node ===\n");

    let mut registry = start_registry(SECOND_ADDR).await?;
    let mut incoming = registry.take_incoming().ok_or("incoming stream taken")?;
    let status = registry.take_status().ok_or("status stream taken")?;
    spawn_status_printer(status);

    let peer = NodeId::parse(FIRST_ADDR)?;
    println!("Greeting {} on both lanes...\n", peer);

    // the stream send dials and queues; the datagram send parks until the
    // stream handshake has advertised the peer's datagram endpoint
    registry.send(&peer, TransportKind::Stream, b"hello from the second node".to_vec())?;
    registry.send(&peer, TransportKind::Datagram, vec![1u8; 1024])?;

    // wait for the replies on both lanes
    recv_one(&mut incoming).await?;
    recv_one(&mut incoming).await?;

    let metrics = registry.metrics();
    println!(
        "\nDialed {} time(s), sent {} message(s), received {}.",
        metrics.connect_attempts, metrics.messages_sent, metrics.messages_received
    );
    println!("Shutting down.");
    registry.shutdown().await;
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() {
    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    // current-thread runtime + LocalSet: the registry owner is a local task
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Failed to create Tokio runtime");
    let local = tokio::task::LocalSet::new();

    match mode {
        "first" => {
            runtime.block_on(local.run_until(async {
                if let Err(e) = run_first().await {
                    eprintln!("First node error: {}", e);
                    std::process::exit(1);
                }
            }));
        }
        "second" => {
            runtime.block_on(local.run_until(async {
                if let Err(e) = run_second().await {
                    eprintln!("Second node error: {}", e);
                    std::process::exit(1);
                }
            }));
        }
        _ => {
            println!("Two-Node Example: dual-transport messaging over TCP\n");
            println!("The nodes exchange messages over a stream lane and a datagram");
            println!("lane; the datagram endpoint is discovered through the stream");
            println!("handshake rather than configured.\n");
            println!("Usage:");
            println!("  cargo run --example two_nodes -- first    # Start the first node");
            println!("  cargo run --example two_nodes -- second   # Start the second node\n");
            println!("Run the first node in one terminal, then the second in another.");
        }
    }
}
