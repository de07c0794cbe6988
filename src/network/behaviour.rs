//! Combined network behaviour for the node

use libp2p::{
    identify, kad, mdns,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    PeerId, StreamProtocol,
};
use std::time::Duration;
use tracing::warn;

/// Kademlia protocol name
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/tangle/kad/1.0.0");

/// Identify protocol version
pub const IDENTIFY_PROTOCOL: &str = "/tangle/id/1.0.0";

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    /// Kademlia DHT for routing and address resolution
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// Local network discovery, empty when disabled or unavailable
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Raw application streams (ping)
    pub streams: libp2p_stream::Behaviour,
}

impl NodeBehaviour {
    /// Create new behaviour
    ///
    /// mDNS must exist before the swarm starts listening, otherwise it never
    /// learns the addresses it should announce.
    pub fn new(
        local_peer_id: PeerId,
        local_public_key: libp2p::identity::PublicKey,
        enable_mdns: bool,
    ) -> Self {
        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_query_timeout(Duration::from_secs(60));

        let store = kad::store::MemoryStore::new(local_peer_id);
        let kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            local_public_key,
        ));

        let mdns = if enable_mdns {
            match mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id) {
                Ok(mdns) => Some(mdns),
                Err(e) => {
                    warn!("mDNS unavailable, local discovery disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            kademlia,
            identify,
            mdns: Toggle::from(mdns),
            streams: libp2p_stream::Behaviour::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    #[tokio::test]
    async fn test_mdns_built_up_front() {
        let keypair = Keypair::generate_ed25519();
        let peer_id = PeerId::from(keypair.public());

        let behaviour = NodeBehaviour::new(peer_id, keypair.public(), true);
        assert!(behaviour.mdns.is_enabled());
    }

    #[tokio::test]
    async fn test_mdns_disabled() {
        let keypair = Keypair::generate_ed25519();
        let peer_id = PeerId::from(keypair.public());

        let behaviour = NodeBehaviour::new(peer_id, keypair.public(), false);
        assert!(!behaviour.mdns.is_enabled());
    }
}
