//! Identifiers, tracker wire messages and join configuration
//!
//! The tracker protocol is JSON over WebSocket text frames, compatible
//! with WebTorrent-style trackers. Field names follow the wire format
//! exactly (`info_hash`, `offer_id`, `failure reason`, ...), so the serde
//! derives here are the single source of truth for the protocol shapes.

use lazy_static::lazy_static;
use p384::ecdsa::SigningKey;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::sync::Arc;

use crate::peer::PeerFactory;

/// Library name mixed into every info-hash derivation.
pub const LIB_NAME: &str = "swarmlink";

/// Number of pre-generated offers advertised per announce.
pub const OFFER_POOL_SIZE: usize = 10;

/// Length of generated ids and info-hashes, in base-36 characters.
pub const HASH_LIMIT: usize = 20;

/// Initial announce interval in seconds.
pub const DEFAULT_ANNOUNCE_SECS: u64 = 33;

/// Upper bound a tracker hint can grow the announce interval to.
pub const MAX_ANNOUNCE_SECS: u64 = 120;

/// Trackers used when the caller does not supply any.
pub const DEFAULT_TRACKER_URLS: [&str; 4] = [
    "wss://tracker.openwebtorrent.com",
    "wss://tracker.btorrent.xyz",
    "wss://tracker.files.fm:7073/announce",
    "wss://tracker.webtorrent.dev",
];

/// How many of the default trackers to announce to when none are configured.
pub const DEFAULT_TRACKER_REDUNDANCY: usize = 2;

/// The only `action` the tracker protocol uses.
pub const ACTION_ANNOUNCE: &str = "announce";

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a random base-36 token of the given length
pub fn gen_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(BASE36[rng.gen_range(0..36)]))
        .collect()
}

lazy_static! {
    static ref SELF_ID: String = gen_id(HASH_LIMIT);
}

/// This process's participant identifier, stable for the process lifetime
pub fn self_id() -> &'static str {
    &SELF_ID
}

/// Render each byte in base 36 and concatenate
fn to_base36(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        if b >= 36 {
            out.push(char::from(BASE36[(b / 36) as usize]));
        }
        out.push(char::from(BASE36[(b % 36) as usize]));
    }
    out
}

/// Derive the swarm key for `(app_id, ns)`.
///
/// SHA-1 over `"<lib>:<app_id>:<ns>"`, rendered per byte in base 36 and
/// truncated to [`HASH_LIMIT`] characters. Two processes with identical
/// inputs share a swarm identity.
pub fn info_hash(app_id: &str, ns: &str) -> String {
    info_hash_seeded(LIB_NAME, app_id, ns)
}

/// Seed-parameterized form of [`info_hash`]
pub fn info_hash_seeded(lib_name: &str, app_id: &str, ns: &str) -> String {
    let digest = Sha1::digest(format!("{lib_name}:{app_id}:{ns}").as_bytes());
    let mut hash = to_base36(&digest);
    hash.truncate(HASH_LIMIT);
    hash
}

/// WebRTC session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as carried on the wire: `{type, sdp}`.
///
/// In signed form the `sdp` field holds the JSON envelope produced by
/// [`sign_sdp`](crate::crypto::sign_sdp) instead of the raw SDP text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// One pooled offer as advertised to a tracker
#[derive(Debug, Clone, Serialize)]
pub struct AnnounceOffer {
    pub offer_id: String,
    pub offer: SessionDescription,
}

/// Outbound announce bundle carrying the offer pool
#[derive(Debug, Serialize)]
pub struct AnnounceRequest {
    pub action: &'static str,
    pub info_hash: String,
    pub numwant: usize,
    pub peer_id: String,
    pub offers: Vec<AnnounceOffer>,
}

/// Outbound answer to a remote offer
#[derive(Debug, Serialize)]
pub struct AnswerRequest {
    pub action: &'static str,
    pub info_hash: String,
    pub peer_id: String,
    pub to_peer_id: String,
    pub offer_id: String,
    pub answer: SessionDescription,
}

/// Inbound tracker frame.
///
/// Trackers duck-type their messages, so every field is optional and the
/// handler selects a branch by what is present.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerReply {
    pub info_hash: Option<String>,
    pub peer_id: Option<String>,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub offer_id: Option<String>,
    pub interval: Option<u64>,
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
}

/// Configuration for joining a namespace
#[derive(Clone)]
pub struct JoinConfig {
    /// Application identifier; part of the swarm key.
    pub app_id: String,
    /// Optional room password for the symmetric room-layer envelope.
    pub password: Option<String>,
    /// Tracker URLs. When `None`, defaults are used, trimmed to
    /// `tracker_redundancy`.
    pub tracker_urls: Option<Vec<String>>,
    /// How many default trackers to use when `tracker_urls` is not set.
    pub tracker_redundancy: Option<usize>,
    /// Opaque RTC configuration forwarded to the peer factory.
    pub rtc_config: Option<serde_json::Value>,
    /// ECDSA P-384 key pair signing local SDPs. Externally generated;
    /// lives for the duration of the join.
    pub signing_key: SigningKey,
    /// Factory producing opaque signaling peers.
    pub peer_factory: Arc<dyn PeerFactory>,
    /// Initial announce interval override in seconds. Tracker hints can
    /// only grow the interval and never past [`MAX_ANNOUNCE_SECS`].
    pub announce_interval_secs: Option<u64>,
}

impl JoinConfig {
    /// Minimal configuration; everything else defaulted
    pub fn new(
        app_id: impl Into<String>,
        signing_key: SigningKey,
        peer_factory: Arc<dyn PeerFactory>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            password: None,
            tracker_urls: None,
            tracker_redundancy: None,
            rtc_config: None,
            signing_key,
            peer_factory,
            announce_interval_secs: None,
        }
    }

    /// Resolve the tracker list, trimming defaults to the redundancy count
    pub(crate) fn resolve_tracker_urls(&self) -> Vec<String> {
        match &self.tracker_urls {
            Some(urls) => urls.clone(),
            None => {
                let redundancy = self
                    .tracker_redundancy
                    .unwrap_or(DEFAULT_TRACKER_REDUNDANCY)
                    .min(DEFAULT_TRACKER_URLS.len());
                DEFAULT_TRACKER_URLS[..redundancy]
                    .iter()
                    .map(|url| url.to_string())
                    .collect()
            }
        }
    }
}
