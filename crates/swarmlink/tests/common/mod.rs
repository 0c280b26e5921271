//! Shared helpers for integration tests
//!
//! `RemotePeer` plays the other side of a swarm: a raw tracker connection
//! with its own signing key, driven frame by frame so tests control
//! exactly what the join under test sees.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use p384::ecdsa::{SigningKey, VerifyingKey};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use swarmlink::{JoinConfig, MockPeerFactory, Room, RoomPeer};

pub struct RemotePeer {
    pub peer_id: String,
    pub signing_key: SigningKey,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RemotePeer {
    pub async fn connect(url: &str) -> Self {
        Self::connect_as(
            url,
            swarmlink::gen_id(20),
            SigningKey::random(&mut rand::rngs::OsRng),
        )
        .await
    }

    /// Connect with a fixed identity; used to place the same participant
    /// on several trackers.
    pub async fn connect_as(url: &str, peer_id: String, signing_key: SigningKey) -> Self {
        let (ws, _) = connect_async(url).await.expect("remote connect");
        Self {
            peer_id,
            signing_key,
            ws,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key().clone()
    }

    /// Produce a signed envelope over `sdp` with this peer's key
    pub fn signed(&self, sdp: &str) -> String {
        swarmlink::sign_sdp(&self.signing_key, sdp).unwrap()
    }

    pub async fn send_raw(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .expect("remote send");
    }

    /// Join the swarm without advertising anything
    pub async fn announce_empty(&mut self, info_hash: &str) {
        self.send_raw(json!({
            "action": "announce",
            "info_hash": info_hash,
            "peer_id": self.peer_id,
            "numwant": 10,
            "offers": [],
        }))
        .await;
    }

    /// Announce one offer whose `sdp` field is the given envelope
    pub async fn announce_offer(&mut self, info_hash: &str, offer_id: &str, envelope: &str) {
        self.send_raw(json!({
            "action": "announce",
            "info_hash": info_hash,
            "peer_id": self.peer_id,
            "numwant": 10,
            "offers": [{ "offer_id": offer_id, "offer": { "type": "offer", "sdp": envelope } }],
        }))
        .await;
    }

    /// Answer an offer frame received from the tracker
    pub async fn answer_offer(&mut self, info_hash: &str, offer_frame: &Value) {
        let to_peer = offer_frame["peer_id"].as_str().unwrap();
        let offer_id = offer_frame["offer_id"].as_str().unwrap();
        let envelope = self.signed(&format!("v=0 remote answer {}", swarmlink::gen_id(8)));
        self.send_raw(json!({
            "action": "announce",
            "info_hash": info_hash,
            "peer_id": self.peer_id,
            "to_peer_id": to_peer,
            "offer_id": offer_id,
            "answer": { "type": "answer", "sdp": envelope },
        }))
        .await;
    }

    /// Next offer- or answer-carrying frame, skipping announce acks
    pub async fn recv_signaling(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a signaling frame")
                .expect("tracker closed the connection")
                .expect("tracker connection error");
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value.get("offer").is_some() || value.get("answer").is_some() {
                    return value;
                }
            }
        }
    }

    /// Assert no offer/answer frame arrives within `window`
    pub async fn expect_no_signaling(&mut self, window: Duration) {
        let outcome = tokio::time::timeout(window, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        if value.get("offer").is_some() || value.get("answer").is_some() {
                            return value;
                        }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => futures::future::pending::<()>().await,
                }
            }
        })
        .await;
        if let Ok(frame) = outcome {
            panic!("expected silence, got {}", frame);
        }
    }
}

/// Config for a join against the given trackers, with a mock peer factory
pub fn test_config(signing_key: SigningKey, tracker_urls: Vec<String>) -> JoinConfig {
    let mut config = JoinConfig::new("integration", signing_key, MockPeerFactory::new());
    config.tracker_urls = Some(tracker_urls);
    config
}

/// Funnel the room's peer-join callback into a channel
pub fn peer_sink(room: &Room) -> mpsc::UnboundedReceiver<RoomPeer> {
    let (tx, rx) = mpsc::unbounded_channel();
    room.on_peer_join(move |peer| {
        let _ = tx.send(peer);
    });
    rx
}

/// Await `rx.recv()` with a timeout, panicking on silence
pub async fn next_peer(rx: &mut mpsc::UnboundedReceiver<RoomPeer>) -> RoomPeer {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a peer connection")
        .expect("peer channel closed")
}

/// A fresh factory with event latency, for race-oriented tests
pub fn laggy_factory() -> Arc<MockPeerFactory> {
    MockPeerFactory::with_latency(Duration::from_millis(10))
}
