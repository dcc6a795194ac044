//! Integration test: identity handshake over in-memory duplex streams.

use std::time::Duration;

use peerlink_protocol::wire::write_frame;
use peerlink_protocol::{handshake_initiator, handshake_responder, ProtocolError};
use peerlink_types::{BluetoothAddress, PeerIdentity};

const DEADLINE: Duration = Duration::from_secs(5);

fn identity(id: &str, last: u8) -> PeerIdentity {
    PeerIdentity::new(id, format!("{id} name"), BluetoothAddress::new([0x50, 0, 0, 0, 0, last]))
}

#[tokio::test]
async fn both_sides_learn_each_other() {
    let (mut client, mut server) = tokio::io::duplex(4096);
    let alice = identity("alice", 1);
    let bob = identity("bob", 2);

    let responder = {
        let bob = bob.clone();
        tokio::spawn(async move { handshake_responder(&mut server, &bob, DEADLINE).await })
    };
    let seen_by_alice = handshake_initiator(&mut client, &alice, DEADLINE).await.unwrap();
    let seen_by_bob = responder.await.unwrap().unwrap();

    assert_eq!(seen_by_alice, bob);
    assert_eq!(seen_by_bob, alice);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out() {
    let (mut client, _server) = tokio::io::duplex(4096);
    let result = handshake_initiator(&mut client, &identity("alice", 1), DEADLINE).await;
    assert!(matches!(result, Err(ProtocolError::Timeout(d)) if d == DEADLINE));
}

#[tokio::test]
async fn identity_missing_a_member_is_rejected() {
    let (mut client, mut server) = tokio::io::duplex(4096);
    let responder = tokio::spawn(async move {
        handshake_responder(&mut server, &identity("bob", 2), DEADLINE).await
    });

    write_frame(&mut client, br#"{"peerId":"mallory","peerName":"m"}"#)
        .await
        .unwrap();
    let result = responder.await.unwrap();
    assert!(matches!(result, Err(ProtocolError::Identity(_))));
}

#[tokio::test]
async fn closed_stream_fails_handshake() {
    let (mut client, server) = tokio::io::duplex(4096);
    drop(server);
    let result = handshake_responder(&mut client, &identity("bob", 2), DEADLINE).await;
    assert!(matches!(result, Err(ProtocolError::Handshake(_))));
}
