//! Join controller and the public room handle
//!
//! [`join_room`] claims the namespace, computes the swarm key, starts the
//! announce loop and the frame/transition event loop, and returns a
//! [`Room`] exposing the peer-join callback slot and teardown. Announces
//! start immediately; the first timer tick is not awaited.

use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::crypto::{derive_room_key, RoomKey};
use crate::peer::RoomPeer;
use crate::signaling::{JoinShared, JoinState, PeerCallback};
use crate::socket::SocketRegistry;
use crate::types::{info_hash, self_id, JoinConfig, DEFAULT_ANNOUNCE_SECS, MAX_ANNOUNCE_SECS};

#[derive(Debug, Error)]
pub enum JoinError {
    /// No tracker URLs left after applying defaults and redundancy.
    #[error("No tracker URLs configured")]
    EmptyTrackers,
    /// The namespace is already joined in this process.
    #[error("Namespace already joined: {0}")]
    AlreadyJoined(String),
}

lazy_static! {
    static ref OCCUPIED_ROOMS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Join `ns` using the process-wide socket registry
pub async fn join_room(config: JoinConfig, ns: &str) -> Result<Room, JoinError> {
    join_room_with(SocketRegistry::global(), config, ns).await
}

/// Join `ns` against an explicit socket registry (tests and embedders)
pub async fn join_room_with(
    registry: Arc<SocketRegistry>,
    config: JoinConfig,
    ns: &str,
) -> Result<Room, JoinError> {
    let tracker_urls = config.resolve_tracker_urls();
    if tracker_urls.is_empty() {
        return Err(JoinError::EmptyTrackers);
    }
    {
        let mut occupied = OCCUPIED_ROOMS.lock().unwrap();
        if !occupied.insert(ns.to_string()) {
            return Err(JoinError::AlreadyJoined(ns.to_string()));
        }
    }

    let info_hash = info_hash(&config.app_id, ns);
    let room_key = config
        .password
        .as_deref()
        .map(|password| derive_room_key(password, ns));
    let announce_secs = config
        .announce_interval_secs
        .unwrap_or(DEFAULT_ANNOUNCE_SECS)
        .min(MAX_ANNOUNCE_SECS);

    let (frames_tx, mut frames_rx) = mpsc::channel(64);
    let (transitions_tx, mut transitions_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (announce_secs_tx, announce_secs_rx) = watch::channel(announce_secs);
    let on_peer: Arc<RwLock<Option<PeerCallback>>> = Arc::new(RwLock::new(None));
    let shared = Arc::new(Mutex::new(JoinShared::default()));

    let state = Arc::new(JoinState {
        info_hash: info_hash.clone(),
        self_id: self_id().to_string(),
        signing_key: config.signing_key.clone(),
        factory: config.peer_factory.clone(),
        rtc_config: config.rtc_config.clone(),
        registry: registry.clone(),
        tracker_urls: tracker_urls.clone(),
        sockets: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        shared: shared.clone(),
        frames_tx,
        transitions_tx,
        on_peer: on_peer.clone(),
        announce_secs_tx,
    });

    info!("Joining {} (swarm {})", ns, info_hash);

    // Event loop: tracker frames and peer transitions, serialized.
    {
        let state = state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    Some(frame) = frames_rx.recv() => state.handle_frame(frame).await,
                    Some(transition) = transitions_rx.recv() => state.handle_transition(transition),
                    else => break,
                }
            }
        });
    }

    // Announce loop: first tick fires immediately, then the adaptive timer.
    {
        let state = state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let mut interval_rx = announce_secs_rx.clone();
        tokio::spawn(async move {
            'announcing: loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                state.announce().await;
                let mut wait = Duration::from_secs(*interval_rx.borrow());
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => continue 'announcing,
                        changed = interval_rx.changed() => {
                            if changed.is_err() {
                                break 'announcing;
                            }
                            // Tracker grew the interval: reinstall the timer.
                            wait = Duration::from_secs(*interval_rx.borrow());
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break 'announcing;
                            }
                        }
                    }
                }
            }
        });
    }

    Ok(Room {
        ns: ns.to_string(),
        info_hash,
        tracker_urls,
        registry,
        on_peer,
        shutdown_tx,
        announce_secs_rx,
        shared,
        room_key,
        left: AtomicBool::new(false),
    })
}

/// Handle to a joined namespace.
///
/// Dropping the handle without calling [`leave`](Room::leave) leaves the
/// join running for the rest of the process.
pub struct Room {
    ns: String,
    info_hash: String,
    tracker_urls: Vec<String>,
    registry: Arc<SocketRegistry>,
    on_peer: Arc<RwLock<Option<PeerCallback>>>,
    shutdown_tx: watch::Sender<bool>,
    announce_secs_rx: watch::Receiver<u64>,
    shared: Arc<Mutex<JoinShared>>,
    room_key: Option<RoomKey>,
    left: AtomicBool,
}

impl Room {
    /// Install the callback receiving verified, connected peers.
    ///
    /// Peers that connect before a callback is installed are dropped;
    /// there is no historical replay.
    pub fn on_peer_join(&self, callback: impl Fn(RoomPeer) + Send + Sync + 'static) {
        *self.on_peer.write().unwrap() = Some(Box::new(callback));
    }

    /// Leave the namespace.
    ///
    /// Idempotent. Stops announcing, releases the tracker listeners and
    /// reaps the offer pool. Tracker sockets stay open; other namespaces
    /// may share them.
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Leaving {} (swarm {})", self.ns, self.info_hash);
        let _ = self.shutdown_tx.send(true);
        for url in &self.tracker_urls {
            self.registry.release(url, &self.info_hash).await;
        }
        OCCUPIED_ROOMS.lock().unwrap().remove(&self.ns);
        let mut shared = self.shared.lock().unwrap();
        let JoinShared {
            pool,
            handled_offers,
            connected_peers,
        } = &mut *shared;
        pool.clean(handled_offers, connected_peers);
    }

    /// Current announce interval in seconds
    pub fn announce_secs(&self) -> u64 {
        *self.announce_secs_rx.borrow()
    }

    /// The namespace's swarm key
    pub fn info_hash(&self) -> &str {
        &self.info_hash
    }

    /// Symmetric room key derived from the configured password, if any
    pub fn room_key(&self) -> Option<&RoomKey> {
        self.room_key.as_ref()
    }
}
