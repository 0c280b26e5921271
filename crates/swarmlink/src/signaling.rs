//! Per-join signaling state machine
//!
//! Parses tracker frames, answers remote offers, routes remote answers
//! into the pooled peer they belong to, and gates both paths on SDP
//! verification. De-duplication flags are taken before the first await so
//! racing frames from redundant trackers cannot double-connect, and
//! connect/close transitions are funnelled through the same event loop as
//! frames so `connected_peers` mutations stay serialized.

use p384::ecdsa::{SigningKey, VerifyingKey};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::crypto::{self, CryptoError};
use crate::peer::{first_signal, PeerEvent, PeerFactory, RoomPeer, SignalingPeer};
use crate::pool::OfferPool;
use crate::socket::{SocketRegistry, SocketState, TrackerFrame, TrackerSocket};
use crate::types::{
    AnnounceOffer, AnnounceRequest, AnswerRequest, SessionDescription, TrackerReply,
    ACTION_ANNOUNCE, MAX_ANNOUNCE_SECS, OFFER_POOL_SIZE,
};

/// Callback invoked with every newly connected, verified peer
pub type PeerCallback = Box<dyn Fn(RoomPeer) + Send + Sync>;

/// Connection-progress events funnelled into the join event loop
pub(crate) enum PeerTransition {
    Connected {
        peer: Arc<dyn SignalingPeer>,
        peer_id: String,
        offer_id: Option<String>,
        key: Arc<OnceLock<VerifyingKey>>,
    },
    Closed {
        peer_id: String,
    },
}

/// De-duplication state shared between the frame handler and the
/// announce loop. Lock scopes never span an await.
#[derive(Default)]
pub(crate) struct JoinShared {
    pub pool: OfferPool,
    pub handled_offers: HashSet<String>,
    pub connected_peers: HashSet<String>,
}

pub(crate) struct JoinState {
    pub info_hash: String,
    pub self_id: String,
    pub signing_key: SigningKey,
    pub factory: Arc<dyn PeerFactory>,
    pub rtc_config: Option<serde_json::Value>,
    pub registry: Arc<SocketRegistry>,
    pub tracker_urls: Vec<String>,
    /// Live socket handles per tracker URL, refreshed by the announce loop.
    pub sockets: Arc<tokio::sync::RwLock<HashMap<String, TrackerSocket>>>,
    pub shared: Arc<Mutex<JoinShared>>,
    pub frames_tx: mpsc::Sender<TrackerFrame>,
    pub transitions_tx: mpsc::Sender<PeerTransition>,
    pub on_peer: Arc<RwLock<Option<PeerCallback>>>,
    pub announce_secs_tx: watch::Sender<u64>,
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

impl JoinState {
    /// Process one inbound tracker frame
    pub async fn handle_frame(&self, frame: TrackerFrame) {
        let reply: TrackerReply = match serde_json::from_str(&frame.text) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Dropping unparseable frame from {}: {}", frame.url, e);
                return;
            }
        };

        if reply.info_hash.as_deref() != Some(self.info_hash.as_str()) {
            return;
        }
        if reply.peer_id.as_deref() == Some(self.self_id.as_str()) {
            return;
        }

        if let Some(reason) = &reply.failure_reason {
            warn!("Tracker {} reported failure: {}", frame.url, reason);
            return;
        }

        if let Some(interval) = reply.interval {
            self.maybe_grow_interval(interval);
        }

        if reply.offer.is_some() {
            self.handle_offer(&frame, reply).await;
        } else if reply.answer.is_some() {
            self.handle_answer(reply).await;
        }
    }

    /// Grow-only interval adaptation, capped at [`MAX_ANNOUNCE_SECS`]
    fn maybe_grow_interval(&self, hint: u64) {
        let current = *self.announce_secs_tx.borrow();
        if current < hint && hint <= MAX_ANNOUNCE_SECS {
            debug!("Announce interval {}s -> {}s per tracker hint", current, hint);
            let _ = self.announce_secs_tx.send(hint);
        }
    }

    /// A remote participant offered a connection: spin up a responder
    /// peer, wire its local answer back to the tracker the offer came on,
    /// then verify and apply the remote description.
    async fn handle_offer(&self, frame: &TrackerFrame, reply: TrackerReply) {
        let (Some(peer_id), Some(offer_id), Some(offer)) =
            (reply.peer_id, reply.offer_id, reply.offer)
        else {
            return;
        };

        {
            let mut shared = self.shared.lock().unwrap();
            if shared.connected_peers.contains(&peer_id) {
                debug!("Ignoring offer from already-connected {}", short(&peer_id));
                return;
            }
            if shared.handled_offers.contains(&offer_id) {
                debug!("Ignoring duplicate offer {}", short(&offer_id));
                return;
            }
            shared.handled_offers.insert(offer_id.clone());
        }

        let peer = self.factory.create(false, self.rtc_config.as_ref());
        let key = Arc::new(OnceLock::new());
        self.spawn_answer_sender(&peer, frame.url.clone(), peer_id.clone(), offer_id);
        self.spawn_transition_watcher(&peer, peer_id.clone(), None, key.clone());

        match crypto::verify_sdp(&offer.sdp) {
            Ok(verified) => {
                let _ = key.set(verified.key);
                let desc = SessionDescription {
                    kind: offer.kind,
                    sdp: verified.sdp,
                };
                if let Err(e) = peer.signal(desc).await {
                    warn!("Failed to signal offer from {}: {}", short(&peer_id), e);
                }
            }
            Err(e) => warn_unverified("offer", &peer_id, &e),
        }
    }

    /// A remote participant answered one of our pooled offers
    async fn handle_answer(&self, reply: TrackerReply) {
        let (Some(peer_id), Some(offer_id), Some(answer)) =
            (reply.peer_id, reply.offer_id, reply.answer)
        else {
            return;
        };

        let peer = {
            let mut shared = self.shared.lock().unwrap();
            if shared.connected_peers.contains(&peer_id) {
                debug!("Ignoring answer from already-connected {}", short(&peer_id));
                return;
            }
            if shared.handled_offers.contains(&offer_id) {
                debug!("Ignoring answer for consumed offer {}", short(&offer_id));
                return;
            }
            let peer = match shared.pool.get(&offer_id) {
                Some(entry) if !entry.peer.destroyed() => entry.peer.clone(),
                _ => {
                    debug!("Answer for unknown offer {}", short(&offer_id));
                    return;
                }
            };
            shared.handled_offers.insert(offer_id.clone());
            peer
        };

        let key = Arc::new(OnceLock::new());
        self.spawn_transition_watcher(&peer, peer_id.clone(), Some(offer_id), key.clone());

        match crypto::verify_sdp(&answer.sdp) {
            Ok(verified) => {
                let _ = key.set(verified.key);
                let desc = SessionDescription {
                    kind: answer.kind,
                    sdp: verified.sdp,
                };
                if let Err(e) = peer.signal(desc).await {
                    warn!("Failed to signal answer from {}: {}", short(&peer_id), e);
                }
            }
            Err(e) => warn_unverified("answer", &peer_id, &e),
        }
    }

    /// Relay the responder peer's first local description back through
    /// the tracker the offer arrived on
    fn spawn_answer_sender(
        &self,
        peer: &Arc<dyn SignalingPeer>,
        url: String,
        to_peer_id: String,
        offer_id: String,
    ) {
        let events = peer.subscribe();
        let signing_key = self.signing_key.clone();
        let sockets = self.sockets.clone();
        let info_hash = self.info_hash.clone();
        let self_id = self.self_id.clone();
        tokio::spawn(async move {
            let Some(local) = first_signal(events).await else {
                return;
            };
            let signed = match crypto::sign_sdp(&signing_key, &local.sdp) {
                Ok(signed) => signed,
                Err(e) => {
                    warn!("Failed to sign local answer: {}", e);
                    return;
                }
            };
            let request = AnswerRequest {
                action: ACTION_ANNOUNCE,
                info_hash,
                peer_id: self_id,
                to_peer_id,
                offer_id,
                answer: SessionDescription {
                    kind: local.kind,
                    sdp: signed,
                },
            };
            let payload = match serde_json::to_string(&request) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to encode answer: {}", e);
                    return;
                }
            };
            let socket = sockets.read().await.get(&url).cloned();
            match socket {
                Some(socket) => {
                    if socket.send(payload).await.is_err() {
                        warn!("Tracker {} gone before answer could be sent", url);
                    }
                }
                None => warn!("No socket handle for {}; dropping answer", url),
            }
        });
    }

    /// Forward a peer's connect/close events into the join event loop
    fn spawn_transition_watcher(
        &self,
        peer: &Arc<dyn SignalingPeer>,
        peer_id: String,
        offer_id: Option<String>,
        key: Arc<OnceLock<VerifyingKey>>,
    ) {
        let mut events = peer.subscribe();
        let peer = peer.clone();
        let transitions = self.transitions_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PeerEvent::Connect) => {
                        let transition = PeerTransition::Connected {
                            peer: peer.clone(),
                            peer_id: peer_id.clone(),
                            offer_id: offer_id.clone(),
                            key: key.clone(),
                        };
                        if transitions.send(transition).await.is_err() {
                            break;
                        }
                    }
                    Ok(PeerEvent::Close) => {
                        let _ = transitions
                            .send(PeerTransition::Closed {
                                peer_id: peer_id.clone(),
                            })
                            .await;
                        break;
                    }
                    Ok(PeerEvent::Signal(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Apply a connect/close transition; runs on the join event loop
    pub fn handle_transition(&self, transition: PeerTransition) {
        match transition {
            PeerTransition::Connected {
                peer,
                peer_id,
                offer_id,
                key,
            } => {
                let newly = {
                    let mut shared = self.shared.lock().unwrap();
                    let newly = shared.connected_peers.insert(peer_id.clone());
                    if let Some(offer_id) = offer_id {
                        // Claim the pooled offer too so another tracker
                        // cannot re-answer it.
                        shared.connected_peers.insert(offer_id);
                    }
                    newly
                };
                if !newly {
                    debug!("Peer {} connected twice; keeping the first", short(&peer_id));
                    return;
                }
                let Some(key) = key.get().cloned() else {
                    warn!(
                        "Peer {} connected without a verified key; dropping",
                        short(&peer_id)
                    );
                    return;
                };
                match &*self.on_peer.read().unwrap() {
                    Some(callback) => callback(RoomPeer {
                        id: peer_id,
                        peer,
                        key,
                    }),
                    None => debug!(
                        "Peer {} connected before a join callback was set",
                        short(&peer_id)
                    ),
                }
            }
            PeerTransition::Closed { peer_id } => {
                let mut shared = self.shared.lock().unwrap();
                if shared.connected_peers.remove(&peer_id) {
                    debug!("Peer {} disconnected", short(&peer_id));
                }
            }
        }
    }

    /// Rotate the offer pool and announce it to every tracker
    pub async fn announce(&self) {
        let pending = {
            let mut shared = self.shared.lock().unwrap();
            let JoinShared {
                pool,
                handled_offers,
                connected_peers,
            } = &mut *shared;
            pool.clean(handled_offers, connected_peers);
            handled_offers.clear();
            *pool = OfferPool::make(&self.factory, self.rtc_config.as_ref());
            pool.pending_offers()
        };

        let descriptions =
            futures::future::join_all(pending.iter().map(|(_, local_sdp)| local_sdp.clone())).await;

        let mut offers = Vec::with_capacity(pending.len());
        for ((offer_id, _), local) in pending.into_iter().zip(descriptions) {
            let Some(local) = local else { continue };
            match crypto::sign_sdp(&self.signing_key, &local.sdp) {
                Ok(signed) => offers.push(AnnounceOffer {
                    offer_id,
                    offer: SessionDescription {
                        kind: local.kind,
                        sdp: signed,
                    },
                }),
                Err(e) => warn!("Failed to sign pooled offer: {}", e),
            }
        }

        let request = AnnounceRequest {
            action: ACTION_ANNOUNCE,
            info_hash: self.info_hash.clone(),
            numwant: OFFER_POOL_SIZE,
            peer_id: self.self_id.clone(),
            offers,
        };
        let payload = match serde_json::to_string(&request) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode announce: {}", e);
                return;
            }
        };

        for url in &self.tracker_urls {
            self.announce_to(url, payload.clone()).await;
        }
    }

    async fn announce_to(&self, url: &str, payload: String) {
        let socket = self
            .registry
            .socket(url, &self.info_hash, self.frames_tx.clone(), false)
            .await;
        let socket = match socket.ready().await {
            SocketState::Open => socket,
            _ => {
                // Stale socket: force a fresh one and retry once this tick.
                debug!("Reopening stale tracker socket: {}", url);
                let socket = self
                    .registry
                    .socket(url, &self.info_hash, self.frames_tx.clone(), true)
                    .await;
                if socket.ready().await != SocketState::Open {
                    warn!("Tracker unreachable this tick: {}", url);
                    return;
                }
                socket
            }
        };
        self.sockets
            .write()
            .await
            .insert(url.to_string(), socket.clone());
        if socket.send(payload).await.is_err() {
            warn!("Tracker send queue closed: {}", url);
        }
    }
}

fn warn_unverified(kind: &str, peer_id: &str, err: &CryptoError) {
    warn!("Dropping {} from {}: {}", kind, short(peer_id), err);
}
