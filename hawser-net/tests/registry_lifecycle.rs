//! Registry lifecycle: establish, queue, fail, shut down.
//!
//! Two real registry nodes run against one in-memory network. The tests
//! drive the public API only and observe behavior through the incoming,
//! status and metrics surfaces.

mod common;

use std::time::Duration;

use common::{
    expect_message, run_local, start_node, start_node_with_config, wait_for_status, wait_until,
    RawPeer,
};
use hawser_net::{
    FrameKind, NodeId, RegistryConfig, SimNet, SocketEndpoint, StatusKind, TransportKind,
};

#[test]
fn messages_roundtrip_on_both_lanes() {
    run_local(async {
        let world = SimNet::new();
        let mut x = start_node(&world, "x", 7000).await;
        let mut y = start_node(&world, "y", 7001).await;

        x.registry
            .send(&y.id(), TransportKind::Stream, b"over stream".to_vec())
            .expect("send");
        let received = expect_message(&mut y.incoming).await;
        assert_eq!(received.source, x.id());
        assert_eq!(received.transport, TransportKind::Stream);
        assert_eq!(received.payload, b"over stream");

        // the reverse direction reuses the channel y learned from the
        // handshake instead of dialing back
        y.registry
            .send(&x.id(), TransportKind::Stream, b"right back".to_vec())
            .expect("send");
        let received = expect_message(&mut x.incoming).await;
        assert_eq!(received.source, y.id());
        assert_eq!(received.payload, b"right back");
        assert_eq!(y.registry.metrics().connect_attempts, 0);

        // datagram lane: x learned y's datagram endpoint from the
        // handshake, so this send needs no out-of-band configuration
        x.registry
            .send(&y.id(), TransportKind::Datagram, b"bulk".to_vec())
            .expect("send");
        let received = expect_message(&mut y.incoming).await;
        assert_eq!(received.transport, TransportKind::Datagram);
        assert_eq!(received.payload, b"bulk");
        assert_eq!(
            x.registry.active_remote(&y.id(), TransportKind::Datagram),
            Some(y.registry.datagram_endpoint().clone())
        );
    });
}

#[test]
fn queued_sends_flush_in_order_once_connected() {
    run_local(async {
        let world = SimNet::new();
        let mut x = start_node(&world, "x", 7000).await;
        let mut y = start_node(&world, "y", 7001).await;
        world.set_connect_latency(Duration::from_millis(50));

        for i in 0..3u8 {
            x.registry
                .send(&y.id(), TransportKind::Stream, vec![i])
                .expect("send");
        }
        wait_until("sends queued behind the dial", || {
            let stats = x.registry.stats();
            stats.pending_connects == 1 && stats.queued_messages == 3
        })
        .await;

        let y_id = y.id();
        wait_for_status(
            &mut x.status,
            &y_id,
            TransportKind::Stream,
            StatusKind::Requested,
        )
        .await;
        wait_for_status(
            &mut x.status,
            &y_id,
            TransportKind::Stream,
            StatusKind::Established,
        )
        .await;
        wait_for_status(
            &mut x.status,
            &y_id,
            TransportKind::Stream,
            StatusKind::SendDelayed,
        )
        .await;

        for i in 0..3u8 {
            assert_eq!(expect_message(&mut y.incoming).await.payload, vec![i]);
        }
        assert_eq!(x.registry.metrics().connect_attempts, 1);
        assert_eq!(x.registry.stats().queued_messages, 0);
    });
}

#[test]
fn pending_queue_cap_drops_newest() {
    run_local(async {
        let world = SimNet::new();
        let config = RegistryConfig::local_network().with_max_queue_size(2);
        let mut x = start_node_with_config(&world, "x", 7000, config).await;
        let mut y = start_node(&world, "y", 7001).await;
        world.set_connect_latency(Duration::from_millis(50));

        for i in 0..4u8 {
            x.registry
                .send(&y.id(), TransportKind::Stream, vec![i])
                .expect("send");
        }
        wait_for_status(
            &mut x.status,
            &y.id(),
            TransportKind::Stream,
            StatusKind::SendDelayed,
        )
        .await;

        // the queue held the first two sends; the rest went over the cap
        for i in 0..2u8 {
            assert_eq!(expect_message(&mut y.incoming).await.payload, vec![i]);
        }
        assert!(y.incoming.try_recv().is_none());
        let metrics = x.registry.metrics();
        assert_eq!(metrics.messages_sent, 2);
        assert_eq!(metrics.messages_dropped, 2);
    });
}

#[test]
fn connect_failure_reports_drop_and_discards_queue() {
    run_local(async {
        let world = SimNet::new();
        let mut x = start_node(&world, "x", 7000).await;
        let ghost = NodeId::parse("ghost:7999").expect("node id");

        x.registry
            .send(&ghost, TransportKind::Stream, b"into the void".to_vec())
            .expect("send");

        wait_for_status(
            &mut x.status,
            &ghost,
            TransportKind::Stream,
            StatusKind::Requested,
        )
        .await;
        wait_for_status(
            &mut x.status,
            &ghost,
            TransportKind::Stream,
            StatusKind::Dropped,
        )
        .await;
        wait_for_status(
            &mut x.status,
            &ghost,
            TransportKind::Stream,
            StatusKind::DropDelayed,
        )
        .await;

        let stats = x.registry.stats();
        assert_eq!(stats.known_nodes, 0);
        assert_eq!(stats.pending_connects, 0);
        assert_eq!(stats.queued_messages, 0);
        let metrics = x.registry.metrics();
        assert_eq!(metrics.connect_failures, 1);
        assert_eq!(metrics.messages_dropped, 1);
    });
}

#[test]
fn connect_failure_after_inbound_identification_salvages_queue() {
    run_local(async {
        let world = SimNet::new();
        let mut x = start_node(&world, "x", 7000).await;
        let z_id = NodeId::parse("z:9000").expect("node id");

        // the dial to z's unbound listener will fail, but only once the
        // connect latency has run its course
        world.set_connect_latency(Duration::from_millis(250));
        x.registry
            .send(&z_id, TransportKind::Stream, b"salvage me".to_vec())
            .expect("send");
        wait_for_status(
            &mut x.status,
            &z_id,
            TransportKind::Stream,
            StatusKind::Requested,
        )
        .await;

        // while the dial is in flight, z shows up on its own
        world.set_connect_latency(Duration::ZERO);
        let mut peer = RawPeer::connect(&world, "z", x.registry.stream_endpoint()).await;
        peer.handshake(&z_id, &SocketEndpoint::new("z", 41000)).await;
        wait_for_status(
            &mut x.status,
            &z_id,
            TransportKind::Stream,
            StatusKind::Established,
        )
        .await;

        // the failed dial reroutes its queue onto the inbound channel
        // instead of declaring the node lost
        wait_for_status(
            &mut x.status,
            &z_id,
            TransportKind::Stream,
            StatusKind::SendDelayed,
        )
        .await;
        let frame = peer.read_frame().await;
        assert_eq!(frame.kind, FrameKind::Data as u8);
        assert_eq!(frame.payload, b"salvage me");

        let metrics = x.registry.metrics();
        assert_eq!(metrics.connect_attempts, 1);
        assert_eq!(metrics.connect_failures, 1);
        assert_eq!(metrics.messages_dropped, 0);
        let stats = x.registry.stats();
        assert_eq!(stats.pending_connects, 0);
        assert_eq!(stats.queued_messages, 0);
        assert_eq!(
            x.registry.active_remote(&z_id, TransportKind::Stream),
            Some(peer.local.clone())
        );
        while let Some(event) = x.status.try_recv() {
            assert!(
                event.kind != StatusKind::Dropped && event.kind != StatusKind::DropDelayed,
                "a salvaged queue must not report the node lost: {event:?}"
            );
        }
    });
}

#[test]
fn shutdown_closes_channels_and_notifies_peers() {
    run_local(async {
        let world = SimNet::new();
        let mut x = start_node(&world, "x", 7000).await;
        let mut y = start_node(&world, "y", 7001).await;

        x.registry
            .send(&y.id(), TransportKind::Stream, b"hello".to_vec())
            .expect("send");
        expect_message(&mut y.incoming).await;
        let x_id = x.id();

        x.registry.shutdown().await;

        // our streams end with the owner
        assert!(x.incoming.recv().await.is_none());
        assert!(x.status.recv().await.is_none());

        // the peer sees the channel die and forgets the node
        wait_for_status(
            &mut y.status,
            &x_id,
            TransportKind::Stream,
            StatusKind::Dropped,
        )
        .await;
        wait_until("peer forgets the node", || {
            let stats = y.registry.stats();
            stats.known_nodes == 0 && stats.open_channels == 0
        })
        .await;

        // the dead node's listener is gone too, so a fresh dial fails
        y.registry
            .send(&x_id, TransportKind::Stream, b"anyone there".to_vec())
            .expect("send");
        wait_for_status(
            &mut y.status,
            &x_id,
            TransportKind::Stream,
            StatusKind::DropDelayed,
        )
        .await;
    });
}
