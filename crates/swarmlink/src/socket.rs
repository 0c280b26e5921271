//! Tracker socket registry
//!
//! One WebSocket per tracker URL, shared process-wide across every joined
//! namespace. Inbound text frames are fanned out to all listeners
//! registered for that URL; listeners self-filter by info-hash. The
//! registry never reconnects on its own: the announce loop force-reopens
//! a socket it finds closed at the next tick.

use futures::{SinkExt, StreamExt};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Connection state of a tracker socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closed,
}

/// A raw inbound frame tagged with the tracker it arrived on
#[derive(Debug, Clone)]
pub struct TrackerFrame {
    pub url: String,
    pub text: String,
}

/// Error: the socket's writer task has gone away
#[derive(Debug, thiserror::Error)]
#[error("tracker socket closed")]
pub struct SocketClosed;

type ListenerMap = Arc<RwLock<HashMap<String, mpsc::Sender<TrackerFrame>>>>;

/// Handle to a shared tracker socket
#[derive(Clone)]
pub struct TrackerSocket {
    url: String,
    out_tx: mpsc::Sender<String>,
    state_rx: watch::Receiver<SocketState>,
}

impl TrackerSocket {
    /// Current connection state
    pub fn state(&self) -> SocketState {
        *self.state_rx.borrow()
    }

    /// Wait until the socket has finished connecting
    pub async fn ready(&self) -> SocketState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow();
            if state != SocketState::Connecting {
                return state;
            }
            if rx.changed().await.is_err() {
                return SocketState::Closed;
            }
        }
    }

    /// Queue a text frame for sending
    pub async fn send(&self, text: String) -> Result<(), SocketClosed> {
        self.out_tx.send(text).await.map_err(|_| SocketClosed)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Process-wide registry mapping tracker URLs to shared sockets.
///
/// Listener maps are kept separately from the sockets themselves so a
/// force-reopened socket keeps serving the namespaces already attached.
pub struct SocketRegistry {
    sockets: RwLock<HashMap<String, TrackerSocket>>,
    listeners: RwLock<HashMap<String, ListenerMap>>,
}

lazy_static! {
    static ref GLOBAL: Arc<SocketRegistry> = Arc::new(SocketRegistry::new());
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            sockets: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// The registry backing [`join_room`](crate::room::join_room)
    pub fn global() -> Arc<SocketRegistry> {
        GLOBAL.clone()
    }

    /// Get (or open) the socket for `url` and register `listener` under
    /// `info_hash`.
    ///
    /// With `force`, a fresh socket replaces whatever was there; the
    /// listener map survives the swap.
    pub async fn socket(
        &self,
        url: &str,
        info_hash: &str,
        listener: mpsc::Sender<TrackerFrame>,
        force: bool,
    ) -> TrackerSocket {
        let listeners = {
            let mut all = self.listeners.write().await;
            all.entry(url.to_string()).or_default().clone()
        };
        listeners
            .write()
            .await
            .insert(info_hash.to_string(), listener);

        let mut sockets = self.sockets.write().await;
        if !force {
            if let Some(existing) = sockets.get(url) {
                return existing.clone();
            }
        }
        let socket = open_socket(url.to_string(), listeners);
        sockets.insert(url.to_string(), socket.clone());
        socket
    }

    /// Drop the listener a namespace registered on `url`.
    ///
    /// Sockets stay open; other namespaces may still be using them.
    pub async fn release(&self, url: &str, info_hash: &str) {
        if let Some(listeners) = self.listeners.read().await.get(url) {
            listeners.write().await.remove(info_hash);
        }
    }

    /// Number of non-closed sockets, for diagnostics and tests
    pub async fn open_sockets(&self) -> usize {
        let sockets = self.sockets.read().await;
        sockets
            .values()
            .filter(|socket| socket.state() != SocketState::Closed)
            .count()
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn open_socket(url: String, listeners: ListenerMap) -> TrackerSocket {
    let (out_tx, out_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(SocketState::Connecting);
    let handle = TrackerSocket {
        url: url.clone(),
        out_tx,
        state_rx,
    };
    tokio::spawn(run_socket(url, listeners, out_rx, state_tx));
    handle
}

async fn run_socket(
    url: String,
    listeners: ListenerMap,
    mut out_rx: mpsc::Receiver<String>,
    state_tx: watch::Sender<SocketState>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("Tracker connect failed for {}: {}", url, e);
            let _ = state_tx.send(SocketState::Closed);
            return;
        }
    };
    debug!("Tracker socket open: {}", url);
    let _ = state_tx.send(SocketState::Open);
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!("Tracker send failed for {}: {}", url, e);
                        break;
                    }
                }
                None => break,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let frame = TrackerFrame {
                        url: url.clone(),
                        text: text.to_string(),
                    };
                    let current = listeners.read().await;
                    for listener in current.values() {
                        let _ = listener.send(frame.clone()).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Tracker socket closed: {}", url);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Tracker socket error for {}: {}", url, e);
                    break;
                }
            },
        }
    }
    let _ = state_tx.send(SocketState::Closed);
}
