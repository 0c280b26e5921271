//! The opaque peer seam
//!
//! The WebRTC peer-connection primitive lives outside this crate. The
//! signaling core drives it through [`SignalingPeer`] and creates
//! instances through a [`PeerFactory`], so production code can plug in a
//! real WebRTC implementation while tests run against
//! [`MockPeer`](crate::mock::MockPeer).

use async_trait::async_trait;
use p384::ecdsa::VerifyingKey;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::SessionDescription;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer already destroyed")]
    Destroyed,
    #[error("Signaling failed: {0}")]
    SignalFailed(String),
}

/// Events a peer emits on its signaling surface
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local session description is ready to be relayed.
    Signal(SessionDescription),
    /// The underlying connection established.
    Connect,
    /// The underlying connection closed or failed.
    Close,
}

/// Signaling surface of a prospective or established connection
#[async_trait]
pub trait SignalingPeer: Send + Sync {
    /// Feed a remote session description into the peer.
    async fn signal(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Tear the connection down. Emits [`PeerEvent::Close`] at most once.
    fn destroy(&self);

    /// Whether [`destroy`](Self::destroy) has run.
    fn destroyed(&self) -> bool;

    /// Subscribe to the peer's event stream.
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;
}

/// Creates peers in initiator or responder mode.
///
/// `rtc_config` is the opaque RTC configuration from
/// [`JoinConfig`](crate::types::JoinConfig), forwarded untouched.
pub trait PeerFactory: Send + Sync {
    fn create(
        &self,
        initiator: bool,
        rtc_config: Option<&serde_json::Value>,
    ) -> Arc<dyn SignalingPeer>;
}

/// A connected peer as handed to the peer-join callback.
///
/// `key` is the public key the counterparty's SDP verified against; it is
/// always populated before the callback runs.
#[derive(Clone)]
pub struct RoomPeer {
    /// The counterparty's participant id.
    pub id: String,
    /// The live connection.
    pub peer: Arc<dyn SignalingPeer>,
    /// Public key the counterparty's SDP verified against.
    pub key: VerifyingKey,
}

/// Resolve once with the peer's first `Signal` event.
///
/// Returns `None` when the peer closes or goes away before signaling.
pub(crate) async fn first_signal(
    mut events: broadcast::Receiver<PeerEvent>,
) -> Option<SessionDescription> {
    loop {
        match events.recv().await {
            Ok(PeerEvent::Signal(desc)) => return Some(desc),
            Ok(PeerEvent::Close) => return None,
            Ok(PeerEvent::Connect) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
