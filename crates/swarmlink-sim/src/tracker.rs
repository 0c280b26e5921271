//! In-memory WebSocket tracker
//!
//! A minimal tracker: keeps a swarm table per info-hash, fans announce
//! offers out to every other member of the swarm, routes answers to their
//! addressee, and acknowledges each announce (optionally with an
//! `interval` hint). Enough protocol to drive announce/offer/answer flows
//! deterministically in tests.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, warn};

/// Swarm membership: info_hash -> peer_id -> outbound frame channel
type Swarms = Arc<RwLock<HashMap<String, HashMap<String, mpsc::Sender<String>>>>>;

pub struct WsTracker {
    addr: Option<SocketAddr>,
    swarms: Swarms,
    announces: Arc<AtomicU64>,
    connections: Arc<AtomicU64>,
    announce_log: Arc<RwLock<Vec<Value>>>,
    interval_hint: Arc<RwLock<Option<u64>>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl WsTracker {
    pub fn new() -> Self {
        Self {
            addr: None,
            swarms: Arc::new(RwLock::new(HashMap::new())),
            announces: Arc::new(AtomicU64::new(0)),
            connections: Arc::new(AtomicU64::new(0)),
            announce_log: Arc::new(RwLock::new(Vec::new())),
            interval_hint: Arc::new(RwLock::new(None)),
            shutdown: None,
        }
    }

    /// Bind an ephemeral local port and start accepting clients
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        self.addr = Some(addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);

        let swarms = self.swarms.clone();
        let announces = self.announces.clone();
        let connections = self.connections.clone();
        let announce_log = self.announce_log.clone();
        let interval_hint = self.interval_hint.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        connections.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(handle_client(
                            stream,
                            swarms.clone(),
                            announces.clone(),
                            announce_log.clone(),
                            interval_hint.clone(),
                        ));
                    }
                }
            }
        });
        Ok(addr)
    }

    /// ws:// URL clients should announce to
    pub fn url(&self) -> Option<String> {
        self.addr.map(|addr| format!("ws://{}", addr))
    }

    /// Include this `interval` hint in every announce acknowledgement
    pub async fn set_interval_hint(&self, secs: Option<u64>) {
        *self.interval_hint.write().await = secs;
    }

    /// Push an `{info_hash, interval}` frame to every member of a swarm
    pub async fn broadcast_interval(&self, info_hash: &str, secs: u64) {
        let frame = json!({ "info_hash": info_hash, "interval": secs }).to_string();
        let members: Vec<mpsc::Sender<String>> = self
            .swarms
            .read()
            .await
            .get(info_hash)
            .map(|swarm| swarm.values().cloned().collect())
            .unwrap_or_default();
        for member in members {
            let _ = member.send(frame.clone()).await;
        }
    }

    /// Announce frames seen so far
    pub fn announce_count(&self) -> u64 {
        self.announces.load(Ordering::Relaxed)
    }

    /// WebSocket connections accepted so far
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// All offer-carrying announce frames, in arrival order
    pub async fn offer_announces(&self) -> Vec<Value> {
        self.announce_log.read().await.clone()
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

impl Default for WsTracker {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_client(
    stream: TcpStream,
    swarms: Swarms,
    announces: Arc<AtomicU64>,
    announce_log: Arc<RwLock<Vec<Value>>>,
    interval_hint: Arc<RwLock<Option<u64>>>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Tracker handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    // Swarm entries this connection registered, dropped when it goes away.
    let mut registered: Vec<(String, String)> = Vec::new();

    loop {
        tokio::select! {
            Some(out) = out_rx.recv() => {
                if write.send(Message::Text(out)).await.is_err() {
                    break;
                }
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if value.get("action").and_then(Value::as_str) != Some("announce") {
                    continue;
                }
                let (Some(info_hash), Some(peer_id)) = (
                    value.get("info_hash").and_then(Value::as_str).map(str::to_string),
                    value.get("peer_id").and_then(Value::as_str).map(str::to_string),
                ) else {
                    continue;
                };

                announces.fetch_add(1, Ordering::Relaxed);

                {
                    let mut swarms = swarms.write().await;
                    let swarm = swarms.entry(info_hash.clone()).or_default();
                    if !swarm.contains_key(&peer_id) {
                        swarm.insert(peer_id.clone(), out_tx.clone());
                        registered.push((info_hash.clone(), peer_id.clone()));
                    }
                }

                if let Some(answer) = value.get("answer") {
                    route_answer(&swarms, &info_hash, &peer_id, answer, &value).await;
                }

                if let Some(offers) = value.get("offers").and_then(Value::as_array) {
                    if !offers.is_empty() {
                        announce_log.write().await.push(value.clone());
                    }
                    fan_out_offers(&swarms, &info_hash, &peer_id, offers).await;
                }

                let mut ack = json!({
                    "action": "announce",
                    "info_hash": info_hash,
                    "complete": 0,
                    "incomplete": 0,
                });
                if let Some(interval) = *interval_hint.read().await {
                    ack["interval"] = json!(interval);
                }
                let _ = out_tx.send(ack.to_string()).await;
            }
        }
    }

    let mut swarms = swarms.write().await;
    for (info_hash, peer_id) in registered {
        if let Some(swarm) = swarms.get_mut(&info_hash) {
            swarm.remove(&peer_id);
        }
    }
}

/// Deliver an answer to the peer it addresses
async fn route_answer(
    swarms: &Swarms,
    info_hash: &str,
    from_peer: &str,
    answer: &Value,
    frame: &Value,
) {
    let Some(to_peer) = frame.get("to_peer_id").and_then(Value::as_str) else {
        return;
    };
    let relayed = json!({
        "info_hash": info_hash,
        "peer_id": from_peer,
        "offer_id": frame.get("offer_id"),
        "answer": answer,
    });
    let target = swarms
        .read()
        .await
        .get(info_hash)
        .and_then(|swarm| swarm.get(to_peer))
        .cloned();
    match target {
        Some(target) => {
            let _ = target.send(relayed.to_string()).await;
        }
        None => debug!("Answer for unknown peer {}", to_peer),
    }
}

/// Relay each announced offer to every other member of the swarm
async fn fan_out_offers(swarms: &Swarms, info_hash: &str, from_peer: &str, offers: &[Value]) {
    let members: Vec<mpsc::Sender<String>> = swarms
        .read()
        .await
        .get(info_hash)
        .map(|swarm| {
            swarm
                .iter()
                .filter(|(peer_id, _)| peer_id.as_str() != from_peer)
                .map(|(_, member)| member.clone())
                .collect()
        })
        .unwrap_or_default();
    if members.is_empty() {
        return;
    }
    for offer in offers {
        let relayed = json!({
            "info_hash": info_hash,
            "peer_id": from_peer,
            "offer_id": offer.get("offer_id"),
            "offer": offer.get("offer"),
        });
        for member in &members {
            let _ = member.send(relayed.to_string()).await;
        }
    }
}
