//! Pre-generated offer pool
//!
//! Each announce tick advertises a bank of initiator peers whose local
//! offers are already waiting, so a tracker's batched peer list can be
//! answered in a single round trip. Entries that were never handled or
//! connected are destroyed when the pool rotates; connected entries have
//! been transferred out and handled entries are torn down by whichever
//! path consumed them.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::peer::{first_signal, PeerFactory, SignalingPeer};
use crate::types::{gen_id, SessionDescription, HASH_LIMIT, OFFER_POOL_SIZE};

/// Shared await-once future for a peer's first local SDP
pub type LocalSdp = Shared<BoxFuture<'static, Option<SessionDescription>>>;

/// A pooled initiator peer and its pending local offer
#[derive(Clone)]
pub struct PooledOffer {
    pub peer: Arc<dyn SignalingPeer>,
    pub local_sdp: LocalSdp,
}

/// Bank of pre-initialized outbound peers keyed by offer id
#[derive(Default)]
pub struct OfferPool {
    entries: HashMap<String, PooledOffer>,
}

impl OfferPool {
    /// Build a pool of exactly [`OFFER_POOL_SIZE`] initiator peers
    pub fn make(
        factory: &Arc<dyn PeerFactory>,
        rtc_config: Option<&serde_json::Value>,
    ) -> Self {
        let mut entries = HashMap::with_capacity(OFFER_POOL_SIZE);
        for _ in 0..OFFER_POOL_SIZE {
            let peer = factory.create(true, rtc_config);
            let local_sdp = first_signal(peer.subscribe()).boxed().shared();
            entries.insert(gen_id(HASH_LIMIT), PooledOffer { peer, local_sdp });
        }
        Self { entries }
    }

    pub fn get(&self, offer_id: &str) -> Option<&PooledOffer> {
        self.entries.get(offer_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of `(offer_id, local_sdp)` pairs for the announce step
    pub fn pending_offers(&self) -> Vec<(String, LocalSdp)> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.local_sdp.clone()))
            .collect()
    }

    /// Empty the pool, destroying every entry that was neither handled
    /// nor connected
    pub fn clean(&mut self, handled: &HashSet<String>, connected: &HashSet<String>) {
        let mut reaped = 0;
        for (offer_id, entry) in self.entries.drain() {
            if !handled.contains(&offer_id) && !connected.contains(&offer_id) {
                entry.peer.destroy();
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!("Reaped {} unclaimed pooled offers", reaped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPeerFactory;
    use crate::peer::PeerFactory;

    fn factory() -> Arc<dyn PeerFactory> {
        MockPeerFactory::new()
    }

    #[tokio::test]
    async fn pool_holds_exactly_pool_size_offers() {
        let pool = OfferPool::make(&factory(), None);
        assert_eq!(pool.len(), OFFER_POOL_SIZE);
    }

    #[tokio::test]
    async fn all_local_offers_resolve() {
        let pool = OfferPool::make(&factory(), None);
        for (_, local_sdp) in pool.pending_offers() {
            let desc = local_sdp.await.expect("initiator must produce an offer");
            assert_eq!(desc.kind, crate::types::SdpType::Offer);
        }
    }

    #[tokio::test]
    async fn local_offer_resolves_once_per_peer() {
        let pool = OfferPool::make(&factory(), None);
        let (_, local_sdp) = pool.pending_offers().pop().unwrap();
        let first = local_sdp.clone().await;
        let second = local_sdp.await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn clean_destroys_only_unclaimed_entries() {
        let mut pool = OfferPool::make(&factory(), None);
        let ids: Vec<String> = pool.pending_offers().into_iter().map(|(id, _)| id).collect();

        let handled: HashSet<String> = ids[0..1].iter().cloned().collect();
        let connected: HashSet<String> = ids[1..2].iter().cloned().collect();
        let handled_peer = pool.get(&ids[0]).unwrap().peer.clone();
        let connected_peer = pool.get(&ids[1]).unwrap().peer.clone();
        let unclaimed_peer = pool.get(&ids[2]).unwrap().peer.clone();

        pool.clean(&handled, &connected);

        assert!(pool.is_empty());
        assert!(!handled_peer.destroyed());
        assert!(!connected_peer.destroyed());
        assert!(unclaimed_peer.destroyed());
    }
}
