//! Service tests over loopback TCP.
//!
//! Each test stands up one or more real services on ephemeral ports and
//! drives them through the handle, or pushes raw bytes at them through a
//! plain socket.

use std::time::Duration;

use rustbit_network::messages::{Ping, Pong};
use rustbit_network::{DisconnectReason, NetworkEvent, RejectReason, REGTEST_MAGIC};

use crate::generators::large_block_frame;
use crate::harness::{test_network_config, test_registry, RawPeer, TestService, EVENT_TIMEOUT};

// ============================================================================
// Connection Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_connect_establishes_both_sides() {
    let mut server = TestService::start().await;
    let mut client = TestService::start().await;

    client.handle.open(server.addr).await.unwrap();

    let event = client
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;
    let NetworkEvent::Connected { peer, outbound } = event else {
        unreachable!()
    };
    assert_eq!(peer, server.addr);
    assert!(outbound);

    let event = server
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;
    let NetworkEvent::Connected { outbound, .. } = event else {
        unreachable!()
    };
    assert!(!outbound);

    assert_eq!(client.handle.peer_count(), 1);
    assert_eq!(server.handle.peer_count(), 1);
    assert!(client.handle.is_connected(server.addr));
    assert_eq!(client.handle.pending_count(), 0);
}

#[tokio::test]
async fn test_connect_refused_reports_rejection() {
    let mut client = TestService::start().await;

    // Bind then drop, so the target port is closed.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    client.handle.open(dead).await.unwrap();
    let event = client
        .wait_for(|e| matches!(e, NetworkEvent::ConnectRejected { .. }))
        .await;
    let NetworkEvent::ConnectRejected { peer, reason } = event else {
        unreachable!()
    };
    assert_eq!(peer, dead);
    assert!(matches!(
        reason,
        RejectReason::Refused(_) | RejectReason::TimedOut
    ));
    assert_eq!(client.handle.pending_count(), 0);
    assert_eq!(client.handle.peer_count(), 0);
}

#[tokio::test]
async fn test_connection_limit_rejects_without_pending() {
    let mut config = test_network_config();
    config.max_connections = 1;
    let mut client = TestService::start_with(config, test_registry(2)).await;
    let first = TestService::start().await;
    let second = TestService::start().await;

    client.handle.open(first.addr).await.unwrap();
    client
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;

    client.handle.open(second.addr).await.unwrap();
    let event = client
        .wait_for(|e| matches!(e, NetworkEvent::ConnectRejected { .. }))
        .await;
    let NetworkEvent::ConnectRejected { peer, reason } = event else {
        unreachable!()
    };
    assert_eq!(peer, second.addr);
    assert_eq!(reason, RejectReason::AtCapacity);
    // The reject left no pending record holding a slot.
    assert_eq!(client.handle.pending_count(), 0);
    assert_eq!(client.handle.peer_count(), 1);
}

#[tokio::test]
async fn test_inbound_rejected_at_capacity() {
    let mut config = test_network_config();
    config.max_connections = 1;
    let mut server = TestService::start_with(config, test_registry(2)).await;

    let _first = RawPeer::connect(server.addr).await;
    server
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;

    let second = RawPeer::connect(server.addr).await;
    let event = server
        .wait_for(|e| matches!(e, NetworkEvent::ConnectRejected { .. }))
        .await;
    let NetworkEvent::ConnectRejected { peer, reason } = event else {
        unreachable!()
    };
    assert_eq!(peer, second.local_addr());
    assert_eq!(reason, RejectReason::AtCapacity);
    assert_eq!(server.handle.peer_count(), 1);
}

#[tokio::test]
async fn test_close_twice_single_disconnect() {
    let mut server = TestService::start().await;
    let mut client = TestService::start().await;

    client.handle.open(server.addr).await.unwrap();
    client
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;
    server
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;

    // Second close races the first teardown; the first reason must win.
    client
        .handle
        .close(server.addr, DisconnectReason::Requested)
        .await
        .unwrap();
    client
        .handle
        .close(server.addr, DisconnectReason::ProtocolError)
        .await
        .unwrap();

    let disconnects: Vec<_> = client
        .drain_events(Duration::from_millis(500))
        .await
        .into_iter()
        .filter(|e| matches!(e, NetworkEvent::Disconnected { .. }))
        .collect();
    assert_eq!(disconnects.len(), 1, "got: {disconnects:?}");
    let NetworkEvent::Disconnected { peer, reason } = &disconnects[0] else {
        unreachable!()
    };
    assert_eq!(*peer, server.addr);
    assert_eq!(*reason, DisconnectReason::Requested);
    assert_eq!(client.handle.peer_count(), 0);

    let event = server
        .wait_for(|e| matches!(e, NetworkEvent::Disconnected { .. }))
        .await;
    let NetworkEvent::Disconnected { reason, .. } = event else {
        unreachable!()
    };
    assert_eq!(reason, DisconnectReason::RemoteClosed);
}

#[tokio::test]
async fn test_shutdown_disconnects_peers() {
    let mut server = TestService::start().await;
    let mut client = TestService::start().await;

    client.handle.open(server.addr).await.unwrap();
    client
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;
    server
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;

    client.handle.shutdown().await.unwrap();

    let event = client
        .wait_for(|e| matches!(e, NetworkEvent::Disconnected { .. }))
        .await;
    let NetworkEvent::Disconnected { reason, .. } = event else {
        unreachable!()
    };
    assert_eq!(reason, DisconnectReason::Requested);

    // The run loop exits once every connection has wound down.
    let result = tokio::time::timeout(EVENT_TIMEOUT, client.task).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));

    let event = server
        .wait_for(|e| matches!(e, NetworkEvent::Disconnected { .. }))
        .await;
    let NetworkEvent::Disconnected { reason, .. } = event else {
        unreachable!()
    };
    assert_eq!(reason, DisconnectReason::RemoteClosed);
}

// ============================================================================
// Message Exchange Tests
// ============================================================================

#[tokio::test]
async fn test_send_and_reply_roundtrip() {
    let mut server = TestService::start().await;
    let mut client = TestService::start().await;

    client.handle.open(server.addr).await.unwrap();
    client
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;
    server
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;

    client
        .handle
        .send(server.addr, &Ping { nonce: 7777 })
        .await
        .unwrap();

    let event = server
        .wait_for(|e| matches!(e, NetworkEvent::Message { .. }))
        .await;
    let NetworkEvent::Message {
        peer,
        header,
        payload,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(header.command.as_str(), "ping");
    assert_eq!(payload.as_any().downcast_ref::<Ping>().unwrap().nonce, 7777);

    server
        .handle
        .send(peer, &Pong { nonce: 7777 })
        .await
        .unwrap();

    let event = client
        .wait_for(|e| matches!(e, NetworkEvent::Message { .. }))
        .await;
    let NetworkEvent::Message { payload, .. } = event else {
        unreachable!()
    };
    assert_eq!(payload.as_any().downcast_ref::<Pong>().unwrap().nonce, 7777);
}

#[tokio::test]
async fn test_broadcast_reaches_every_peer() {
    let mut hub = TestService::start().await;
    let mut a = TestService::start().await;
    let mut b = TestService::start().await;

    hub.handle.open(a.addr).await.unwrap();
    hub.handle.open(b.addr).await.unwrap();
    hub.wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;
    hub.wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;
    a.wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;
    b.wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;

    hub.handle.broadcast(&Ping { nonce: 31 }).await.unwrap();

    for service in [&mut a, &mut b] {
        let event = service
            .wait_for(|e| matches!(e, NetworkEvent::Message { .. }))
            .await;
        let NetworkEvent::Message { payload, .. } = event else {
            unreachable!()
        };
        assert_eq!(payload.as_any().downcast_ref::<Ping>().unwrap().nonce, 31);
    }
}

#[tokio::test]
async fn test_garbage_bytes_tear_connection_down() {
    let mut server = TestService::start().await;
    let mut raw = RawPeer::connect(server.addr).await;
    let raw_addr = raw.local_addr();

    let event = server
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;
    let NetworkEvent::Connected { peer, outbound } = event else {
        unreachable!()
    };
    assert_eq!(peer, raw_addr);
    assert!(!outbound);

    raw.send(&[0xDE; 64]).await;

    let event = server
        .wait_for(|e| matches!(e, NetworkEvent::DecodeError { .. }))
        .await;
    let NetworkEvent::DecodeError { peer, detail } = event else {
        unreachable!()
    };
    assert_eq!(peer, raw_addr);
    assert!(detail.contains("Magic mismatch"), "got: {detail}");

    let event = server
        .wait_for(|e| matches!(e, NetworkEvent::Disconnected { .. }))
        .await;
    let NetworkEvent::Disconnected { peer, reason } = event else {
        unreachable!()
    };
    assert_eq!(peer, raw_addr);
    assert_eq!(reason, DisconnectReason::ProtocolError);
    assert_eq!(server.handle.peer_count(), 0);
}

#[tokio::test]
async fn test_large_message_streams_over_tcp() {
    let mut server = TestService::start().await;
    let mut raw = RawPeer::connect(server.addr).await;
    server
        .wait_for(|e| matches!(e, NetworkEvent::Connected { .. }))
        .await;

    // Six transactions in batches of two: a start chunk plus three batches.
    let (frame, body) = large_block_frame(REGTEST_MAGIC, 6, 60);
    assert!(body.len() >= 512);

    let mid = frame.len() / 2;
    raw.send(&frame[..mid]).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.send(&frame[mid..]).await;

    let mut sequences = Vec::new();
    let mut finished = false;
    while !finished {
        let event = server
            .wait_for(|e| matches!(e, NetworkEvent::MessageChunk { .. }))
            .await;
        let NetworkEvent::MessageChunk {
            peer,
            header,
            sequence,
            done,
            ..
        } = event
        else {
            unreachable!()
        };
        assert_eq!(peer, raw.local_addr());
        assert_eq!(header.command.as_str(), "block");
        sequences.push(sequence);
        finished = done;
    }
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    // The connection survives the streamed message.
    assert_eq!(server.handle.peer_count(), 1);
}
