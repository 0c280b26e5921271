//! Serverless peer discovery and authenticated WebRTC signaling
//!
//! swarmlink joins a *namespace* (a logical room scoped to an
//! application) by announcing to a pool of BitTorrent-style WebSocket
//! trackers, exchanges ECDSA-signed session descriptions with the other
//! participants of the same swarm, and hands connected, key-verified
//! peers back to the caller.
//!
//! - **Rendezvous**: one shared WebSocket per tracker URL, multiplexed
//!   across namespaces. Announces carry a pre-signed offer pool so a
//!   tracker's batched peer list can be answered in a single round trip.
//! - **Authentication**: every SDP travels inside a signed envelope
//!   (ECDSA P-384 / SHA-384 with the signer's key embedded as a JWK);
//!   a peer is handed out only after its counterparty's SDP verified.
//! - **Pluggable peers**: the WebRTC primitive is consumed through the
//!   [`SignalingPeer`]/[`PeerFactory`] traits; [`MockPeerFactory`] runs
//!   the whole flow in memory for tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use swarmlink::{join_room, JoinConfig, MockPeerFactory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let signing_key = p384::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
//!     let config = JoinConfig::new("demo-app", signing_key, MockPeerFactory::new());
//!     let room = join_room(config, "lobby").await?;
//!     room.on_peer_join(|peer| println!("peer {} connected", peer.id));
//!     // ...
//!     room.leave().await;
//!     Ok(())
//! }
//! ```

pub mod crypto;
pub mod mock;
pub mod peer;
mod pool;
pub mod room;
mod signaling;
pub mod socket;
pub mod types;

pub use crypto::{
    decrypt, derive_room_key, encrypt, sign_sdp, verify_sdp, CryptoError, RoomKey, SignedEnvelope,
    VerifiedSdp,
};
pub use mock::{MockPeer, MockPeerFactory};
pub use peer::{PeerError, PeerEvent, PeerFactory, RoomPeer, SignalingPeer};
pub use room::{join_room, join_room_with, JoinError, Room};
pub use socket::{SocketRegistry, SocketState, TrackerFrame, TrackerSocket};
pub use types::{
    gen_id, info_hash, self_id, JoinConfig, SdpType, SessionDescription, DEFAULT_ANNOUNCE_SECS,
    DEFAULT_TRACKER_URLS, HASH_LIMIT, LIB_NAME, MAX_ANNOUNCE_SECS, OFFER_POOL_SIZE,
};
