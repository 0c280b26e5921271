//! In-memory peers for tests and simulation
//!
//! [`MockPeer`] scripts the signaling surface of a WebRTC connection:
//! initiators emit a local offer, responders answer the first offer they
//! are signaled with, and both sides report `Connect` once the
//! counterpart description arrives. An optional latency delays every
//! event to surface ordering races.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::peer::{PeerError, PeerEvent, PeerFactory, SignalingPeer};
use crate::types::{gen_id, SdpType, SessionDescription};

/// Factory producing [`MockPeer`]s
pub struct MockPeerFactory {
    latency: Duration,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latency: Duration::ZERO,
        })
    }

    /// Delay every emitted event by `latency`
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self { latency })
    }
}

impl PeerFactory for MockPeerFactory {
    fn create(
        &self,
        initiator: bool,
        _rtc_config: Option<&serde_json::Value>,
    ) -> Arc<dyn SignalingPeer> {
        let peer = Arc::new(MockPeer::new(initiator, self.latency));
        if initiator {
            peer.clone().spawn_local_offer();
        }
        peer
    }
}

/// Scripted in-memory stand-in for a WebRTC peer connection
pub struct MockPeer {
    initiator: bool,
    latency: Duration,
    events: broadcast::Sender<PeerEvent>,
    destroyed: AtomicBool,
}

impl MockPeer {
    fn new(initiator: bool, latency: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            initiator,
            latency,
            events,
            destroyed: AtomicBool::new(false),
        }
    }

    fn spawn_local_offer(self: Arc<Self>) {
        tokio::spawn(async move {
            // Hold the offer until someone is listening, like a real peer
            // that only starts gathering once handlers are attached.
            while self.events.receiver_count() == 0 {
                if self.destroyed() {
                    return;
                }
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(self.latency).await;
            if self.destroyed() {
                return;
            }
            let desc = SessionDescription {
                kind: SdpType::Offer,
                sdp: mock_sdp("offer"),
            };
            let _ = self.events.send(PeerEvent::Signal(desc));
        });
    }
}

fn mock_sdp(label: &str) -> String {
    format!("v=0 {} {}", label, gen_id(16))
}

#[async_trait]
impl SignalingPeer for MockPeer {
    async fn signal(&self, desc: SessionDescription) -> Result<(), PeerError> {
        if self.destroyed() {
            return Err(PeerError::Destroyed);
        }
        tokio::time::sleep(self.latency).await;
        match desc.kind {
            SdpType::Offer if !self.initiator => {
                let answer = SessionDescription {
                    kind: SdpType::Answer,
                    sdp: mock_sdp("answer"),
                };
                let _ = self.events.send(PeerEvent::Signal(answer));
                let _ = self.events.send(PeerEvent::Connect);
                Ok(())
            }
            SdpType::Answer if self.initiator => {
                let _ = self.events.send(PeerEvent::Connect);
                Ok(())
            }
            kind => Err(PeerError::SignalFailed(format!(
                "unexpected {:?} for this role",
                kind
            ))),
        }
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(PeerEvent::Close);
        }
    }

    fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}
