//! P2P Networking Layer
//!
//! Uses libp2p for peer-to-peer communication with:
//! - Kademlia DHT for routing and address resolution
//! - mDNS for local network discovery
//! - A line-based ping protocol over raw libp2p streams
//! - Noise for encryption, Yamux for multiplexing

pub mod behaviour;
pub mod discovery;
pub mod node;
pub mod ping;
pub mod protocol;
pub mod record;

pub use behaviour::NodeBehaviour;
pub use discovery::{DiscoveryConfig, DiscoveryCoordinator, DiscoveryState, DiscoveryTransport};
pub use node::{Node, NodeError, NodeHandle};
pub use protocol::{PingError, PingExchange, PING_PROTOCOL};
pub use record::PeerRecord;
