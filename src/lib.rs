//! tangle - a minimal libp2p node
//!
//! A peer-to-peer node that:
//! - Keeps a persistent Ed25519 identity in its data directory
//! - Joins a Kademlia DHT and discovers local peers over mDNS
//! - Connects to every discovered peer with a bounded deadline
//! - Answers and sends a line-based ping over `/tangle/ping/1.0.0` streams

pub mod config;
pub mod identity;
pub mod network;
pub mod session;

// Re-export commonly used types
pub use config::NodeConfig;
pub use identity::{load_or_create, IdentityError};
pub use network::{
    DiscoveryCoordinator, DiscoveryState, Node, NodeError, NodeHandle, PeerRecord, PingError,
    PingExchange, PING_PROTOCOL,
};
pub use session::{NodeSession, SessionError};
