//! Duplicate channel resolution.
//!
//! When both ends dial each other at once, each side ends up with two
//! live channels to the same node. Both sides must pick the same
//! survivor without exchanging votes, which the rank (the sum of a
//! connection's two ports, tie-broken on the sorted endpoint pair)
//! guarantees. The close handshake that follows has to cope with a peer
//! whose picture of the world is behind ours.

mod common;

use common::{expect_message, run_local, start_node, wait_until, RawPeer};
use hawser_net::{ControlMessage, FrameKind, NodeId, SimNet, SocketEndpoint, TransportKind};

#[test]
fn simultaneous_dials_converge_on_one_survivor() {
    run_local(async {
        let world = SimNet::new();
        let mut x = start_node(&world, "x", 7000).await;
        let mut y = start_node(&world, "y", 7001).await;
        let x_id = x.id();
        let y_id = y.id();

        // both dial before either connect lands
        x.registry
            .send(&y_id, TransportKind::Stream, b"to y".to_vec())
            .expect("send");
        y.registry
            .send(&x_id, TransportKind::Stream, b"to x".to_vec())
            .expect("send");

        let on_y = expect_message(&mut y.incoming).await;
        assert_eq!(on_y.payload, b"to y");
        let on_x = expect_message(&mut x.incoming).await;
        assert_eq!(on_x.payload, b"to x");

        wait_until("x converged on one channel", || {
            x.registry.stats().open_channels == 1
        })
        .await;
        wait_until("y converged on one channel", || {
            y.registry.stats().open_channels == 1
        })
        .await;
        assert_eq!(x.registry.metrics().duplicates_resolved, 1);
        assert_eq!(y.registry.metrics().duplicates_resolved, 1);

        // both sides kept the same connection: exactly one of them is
        // holding its own outbound channel, and the survivor's rank is
        // no greater than the retired channel's
        let x_remote = x
            .registry
            .active_remote(&y_id, TransportKind::Stream)
            .expect("x active");
        let y_remote = y
            .registry
            .active_remote(&x_id, TransportKind::Stream)
            .expect("y active");
        let survivor_rank = u32::from(x_remote.port) + u32::from(y_remote.port);
        let total = 7000 + 7001 + 40002 + 40003;
        assert!(
            survivor_rank <= total - survivor_rank,
            "survivor rank {survivor_rank} lost the contest"
        );
        assert!((x_remote.port == 7001) != (y_remote.port == 7000));

        // the surviving channel still carries traffic
        x.registry
            .send(&y_id, TransportKind::Stream, b"after".to_vec())
            .expect("send");
        let after = expect_message(&mut y.incoming).await;
        assert_eq!(after.payload, b"after");
        assert_eq!(x.registry.metrics().connect_attempts, 1);
        assert_eq!(y.registry.metrics().connect_attempts, 1);
    });
}

#[test]
fn close_request_for_the_only_channel_is_refused() {
    run_local(async {
        let world = SimNet::new();
        let mut x = start_node(&world, "x", 7000).await;
        let z_id = NodeId::parse("z:9000").expect("node id");

        let mut peer = RawPeer::connect(&world, "z", x.registry.stream_endpoint()).await;
        peer.handshake(&z_id, &SocketEndpoint::new("z", 41000)).await;

        // asking to close the only channel we have gets a liveness
        // check back instead of agreement
        peer.write_control(&ControlMessage::CloseRequest {
            source: z_id.clone(),
        })
        .await;
        let check = peer.read_control(FrameKind::CheckActive).await;
        match check {
            ControlMessage::CheckActive { source } => assert_eq!(source, x.id()),
            other => panic!("expected a liveness check, got {other:?}"),
        }

        peer.write_frame(FrameKind::Data, b"still here").await;
        let received = expect_message(&mut x.incoming).await;
        assert_eq!(received.payload, b"still here");
        assert_eq!(x.registry.stats().open_channels, 1);
    });
}

#[test]
fn close_request_for_the_active_channel_yields_to_a_duplicate() {
    run_local(async {
        let world = SimNet::new();
        let mut x = start_node(&world, "x", 7000).await;
        let z_id = NodeId::parse("z:9000").expect("node id");
        let z_datagram = SocketEndpoint::new("z", 41000);

        let mut first = RawPeer::connect(&world, "z", x.registry.stream_endpoint()).await;
        first.handshake(&z_id, &z_datagram).await;
        let mut second = RawPeer::connect(&world, "z", x.registry.stream_endpoint()).await;
        second.handshake(&z_id, &z_datagram).await;
        assert_eq!(
            x.registry.active_remote(&z_id, TransportKind::Stream),
            Some(first.local.clone())
        );

        // with a second channel on hand even the active one may close;
        // routing just moves over
        first
            .write_control(&ControlMessage::CloseRequest {
                source: z_id.clone(),
            })
            .await;
        let reply = first.read_control(FrameKind::Closed).await;
        assert!(matches!(reply, ControlMessage::Closed { .. }));
        first.expect_eof().await;

        wait_until("routing moved to the surviving channel", || {
            x.registry.active_remote(&z_id, TransportKind::Stream) == Some(second.local.clone())
        })
        .await;
        assert_eq!(x.registry.stats().open_channels, 1);

        x.registry
            .send(&z_id, TransportKind::Stream, b"rerouted".to_vec())
            .expect("send");
        let frame = second.read_frame().await;
        assert_eq!(frame.kind, FrameKind::Data as u8);
        assert_eq!(frame.payload, b"rerouted");
    });
}

#[test]
fn check_active_promotes_the_vouched_channel() {
    run_local(async {
        let world = SimNet::new();
        let mut x = start_node(&world, "x", 7000).await;
        let z_id = NodeId::parse("z:9000").expect("node id");
        let z_datagram = SocketEndpoint::new("z", 41000);

        let mut first = RawPeer::connect(&world, "z", x.registry.stream_endpoint()).await;
        first.handshake(&z_id, &z_datagram).await;
        let mut second = RawPeer::connect(&world, "z", x.registry.stream_endpoint()).await;
        second.handshake(&z_id, &z_datagram).await;

        // traffic on the duplicate starts a contest the first channel
        // wins on rank, so the second is told to close
        second.write_frame(FrameKind::Data, b"dup").await;
        let received = expect_message(&mut x.incoming).await;
        assert_eq!(received.payload, b"dup");
        let request = second.read_control(FrameKind::CloseRequest).await;
        assert!(matches!(request, ControlMessage::CloseRequest { .. }));
        assert_eq!(x.registry.metrics().duplicates_resolved, 1);

        // vetoing the close vouches for the channel, which takes over
        // the active designation outright
        second
            .write_control(&ControlMessage::CheckActive {
                source: z_id.clone(),
            })
            .await;
        wait_until("the vouched channel took over", || {
            x.registry.active_remote(&z_id, TransportKind::Stream) == Some(second.local.clone())
        })
        .await;
        assert_eq!(x.registry.stats().open_channels, 2);

        // a second vouch finds both ends in agreement, so the leftover
        // duplicate is asked to close
        second
            .write_control(&ControlMessage::CheckActive {
                source: z_id.clone(),
            })
            .await;
        let request = first.read_control(FrameKind::CloseRequest).await;
        match request {
            ControlMessage::CloseRequest { source } => assert_eq!(source, x.id()),
            other => panic!("expected a close request, got {other:?}"),
        }
        assert_eq!(x.registry.metrics().duplicates_resolved, 2);
        first
            .write_control(&ControlMessage::Closed {
                source: z_id.clone(),
            })
            .await;
        first.expect_eof().await;

        wait_until("converged on the vouched channel", || {
            x.registry.stats().open_channels == 1
        })
        .await;
        x.registry
            .send(&z_id, TransportKind::Stream, b"after".to_vec())
            .expect("send");
        let frame = second.read_frame().await;
        assert_eq!(frame.kind, FrameKind::Data as u8);
        assert_eq!(frame.payload, b"after");
    });
}
