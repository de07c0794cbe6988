//! Peer records handed out by discovery

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use std::collections::HashMap;

/// A remote peer and the addresses it was seen at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Group `(peer, address)` pairs into one record per peer
    ///
    /// Records come back in first-seen order; duplicate addresses are dropped.
    pub fn group(pairs: impl IntoIterator<Item = (PeerId, Multiaddr)>) -> Vec<PeerRecord> {
        let mut index: HashMap<PeerId, usize> = HashMap::new();
        let mut records: Vec<PeerRecord> = Vec::new();

        for (peer_id, addr) in pairs {
            let slot = *index.entry(peer_id).or_insert_with(|| {
                records.push(PeerRecord::new(peer_id, Vec::new()));
                records.len() - 1
            });
            let addrs = &mut records[slot].addrs;
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }

        records
    }
}

/// Peer ID carried in a trailing `/p2p/...` component, if any
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Some(peer_id),
        _ => None,
    }
}

/// `addr` with any trailing `/p2p/...` component removed
pub fn without_peer_id(addr: &Multiaddr) -> Multiaddr {
    let mut addr = addr.clone();
    if peer_id_of(&addr).is_some() {
        addr.pop();
    }
    addr
}
