//! End-to-end signaling flows against an in-memory tracker
//!
//! One real join per test; the remote side of the swarm is driven frame
//! by frame through a raw tracker connection with its own signing key.

mod common;

use common::{laggy_factory, next_peer, peer_sink, test_config, RemotePeer};
use p384::ecdsa::SigningKey;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use swarmlink::{join_room_with, verify_sdp, SocketRegistry};
use swarmlink_sim::WsTracker;

async fn started_tracker() -> (WsTracker, String) {
    let mut tracker = WsTracker::new();
    tracker.start().await.expect("tracker start");
    let url = tracker.url().expect("tracker url");
    (tracker, url)
}

/// A remote offer is verified, answered with a signed envelope, and the
/// responder peer is handed out with the remote's key pinned.
#[tokio::test]
async fn answers_remote_offer_and_connects() {
    let (mut tracker, url) = started_tracker().await;
    let registry = Arc::new(SocketRegistry::new());
    let join_key = SigningKey::random(&mut OsRng);

    let room = join_room_with(
        registry,
        test_config(join_key.clone(), vec![url.clone()]),
        "it-responder",
    )
    .await
    .unwrap();
    let mut peers = peer_sink(&room);
    let info_hash = room.info_hash().to_string();

    // Let the initial announce register the join with the tracker.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut remote = RemotePeer::connect(&url).await;
    let offer_id = swarmlink::gen_id(20);
    let envelope = remote.signed("v=0 remote offer");
    remote.announce_offer(&info_hash, &offer_id, &envelope).await;

    // The join answers on the same tracker, with a verifiable envelope.
    let answer = remote.recv_signaling().await;
    assert_eq!(answer["peer_id"], swarmlink::self_id());
    assert_eq!(answer["offer_id"], offer_id.as_str());
    assert_eq!(answer["answer"]["type"], "answer");
    let verified = verify_sdp(answer["answer"]["sdp"].as_str().unwrap()).unwrap();
    assert_eq!(&verified.key, join_key.verifying_key());

    // And hands out the connected peer with the remote's key pinned.
    let peer = next_peer(&mut peers).await;
    assert_eq!(peer.id, remote.peer_id);
    assert_eq!(peer.key, remote.verifying_key());
    assert!(!peer.peer.destroyed());

    room.leave().await;
    tracker.stop().await;
}

/// A pooled offer travels out in an announce, the remote answers it, and
/// the pooled initiator peer connects.
#[tokio::test]
async fn pooled_offer_is_answered_and_connects() {
    let (mut tracker, url) = started_tracker().await;
    let registry = Arc::new(SocketRegistry::new());
    let join_key = SigningKey::random(&mut OsRng);

    let mut config = test_config(join_key.clone(), vec![url.clone()]);
    config.announce_interval_secs = Some(1);
    let room = join_room_with(registry, config, "it-initiator").await.unwrap();
    let mut peers = peer_sink(&room);
    let info_hash = room.info_hash().to_string();

    tokio::time::sleep(Duration::from_millis(150)).await;

    // The remote joins the swarm and waits for the next announce tick.
    let mut remote = RemotePeer::connect(&url).await;
    remote.announce_empty(&info_hash).await;

    let offer = remote.recv_signaling().await;
    assert_eq!(offer["peer_id"], swarmlink::self_id());
    let verified = verify_sdp(offer["offer"]["sdp"].as_str().unwrap()).unwrap();
    assert_eq!(&verified.key, join_key.verifying_key());

    remote.answer_offer(&info_hash, &offer).await;

    let peer = next_peer(&mut peers).await;
    assert_eq!(peer.id, remote.peer_id);
    assert_eq!(peer.key, remote.verifying_key());

    room.leave().await;
    tracker.stop().await;
}

/// The same offer arriving over two redundant trackers produces exactly
/// one responder peer and one connection.
#[tokio::test]
async fn duplicate_offer_across_trackers_connects_once() {
    let (mut tracker_a, url_a) = started_tracker().await;
    let (mut tracker_b, url_b) = started_tracker().await;
    let registry = Arc::new(SocketRegistry::new());

    let mut config = test_config(
        SigningKey::random(&mut OsRng),
        vec![url_a.clone(), url_b.clone()],
    );
    config.peer_factory = laggy_factory();
    let room = join_room_with(registry, config, "it-duplicate").await.unwrap();
    let mut peers = peer_sink(&room);
    let info_hash = room.info_hash().to_string();

    tokio::time::sleep(Duration::from_millis(150)).await;

    // One identity, two tracker connections, the same signed offer.
    let remote_key = SigningKey::random(&mut OsRng);
    let remote_id = swarmlink::gen_id(20);
    let mut remote_a = RemotePeer::connect_as(&url_a, remote_id.clone(), remote_key.clone()).await;
    let mut remote_b = RemotePeer::connect_as(&url_b, remote_id.clone(), remote_key).await;

    let offer_id = swarmlink::gen_id(20);
    let envelope = remote_a.signed("v=0 duplicated offer");
    remote_a.announce_offer(&info_hash, &offer_id, &envelope).await;
    remote_b.announce_offer(&info_hash, &offer_id, &envelope).await;

    let peer = next_peer(&mut peers).await;
    assert_eq!(peer.id, remote_id);

    // No second connection for the duplicate.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(peers.try_recv().is_err());

    room.leave().await;
    tracker_a.stop().await;
    tracker_b.stop().await;
}

/// A tampered signature fails verification: no answer goes out and no
/// peer is handed to the caller.
#[tokio::test]
async fn tampered_offer_is_dropped() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let (mut tracker, url) = started_tracker().await;
    let registry = Arc::new(SocketRegistry::new());

    let room = join_room_with(
        registry,
        test_config(SigningKey::random(&mut OsRng), vec![url.clone()]),
        "it-tampered",
    )
    .await
    .unwrap();
    let mut peers = peer_sink(&room);
    let info_hash = room.info_hash().to_string();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut remote = RemotePeer::connect(&url).await;
    let envelope = remote.signed("v=0 tampered offer");

    // Flip one bit of the signature inside the envelope.
    let mut value: serde_json::Value = serde_json::from_str(&envelope).unwrap();
    let mut raw = BASE64.decode(value["signature"].as_str().unwrap()).unwrap();
    raw[0] ^= 0x01;
    value["signature"] = serde_json::Value::String(BASE64.encode(raw));

    remote
        .announce_offer(&info_hash, &swarmlink::gen_id(20), &value.to_string())
        .await;

    remote.expect_no_signaling(Duration::from_millis(700)).await;
    assert!(peers.try_recv().is_err());

    room.leave().await;
    tracker.stop().await;
}
