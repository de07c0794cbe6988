//! Node session lifecycle
//!
//! Startup runs identity → listen → explicit dial → routing → discovery →
//! reporting. Any failure before routing aborts the whole startup; later
//! steps only log. Shutdown releases everything in reverse order and keeps
//! going past individual failures.

mod reporter;

pub use reporter::{report_lines, PeerReporter};

use libp2p::{Multiaddr, PeerId};
use std::future::Future;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::identity::{self, IdentityError};
use crate::network::{
    ping, record::without_peer_id, DiscoveryConfig, DiscoveryCoordinator, DiscoveryState, Node,
    NodeError, NodeHandle, PingError, PingExchange,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Startup failed: {0}")]
    Startup(#[from] NodeError),
    #[error("Ping responder error: {0}")]
    Responder(#[from] PingError),
    #[error("Failed to connect to peer {addr}: {source}")]
    PeerDial {
        addr: Multiaddr,
        #[source]
        source: NodeError,
    },
}

/// A running node and the tasks it owns
pub struct NodeSession {
    handle: NodeHandle,
    listen_addrs: Vec<Multiaddr>,
    node_task: JoinHandle<()>,
    responder: JoinHandle<()>,
    discovery: DiscoveryCoordinator<NodeHandle>,
    reporter: PeerReporter,
}

impl NodeSession {
    /// Bring the node up; returns once it is in steady state
    pub async fn start(config: NodeConfig) -> Result<Self, SessionError> {
        let keypair = identity::load_or_create(&config.data_dir)?;
        let (node, handle) = Node::bind(keypair, &config)?;
        info!("Hello! I am a libp2p node. Peer ID: {}", handle.local_peer_id());

        let node_task = tokio::spawn(node.run());

        let (listen_addrs, responder, dialed) = match connect_phase(&handle, &config).await {
            Ok(parts) => parts,
            Err(e) => {
                if handle.shutdown().await.is_ok() {
                    let _ = node_task.await;
                }
                return Err(e);
            }
        };

        let bootstrap = dialed.into_iter().collect();
        if let Err(e) = handle.join_routing(bootstrap).await {
            warn!("DHT bootstrap warning: {}", e);
        }

        let mut discovery = DiscoveryCoordinator::new(
            handle.clone(),
            DiscoveryConfig {
                connect_timeout: config.connect_timeout,
                ping_discovered: config.ping_discovered,
            },
        );
        if config.enable_mdns {
            if let Err(e) = discovery.start().await {
                warn!("mDNS service couldn't start: {}", e);
            }
        }

        let reporter = PeerReporter::spawn(handle.clone(), config.report_interval);

        Ok(Self {
            handle,
            listen_addrs,
            node_task,
            responder,
            discovery,
            reporter,
        })
    }

    /// Get local peer ID
    pub fn local_peer_id(&self) -> PeerId {
        self.handle.local_peer_id()
    }

    /// Addresses the node was listening on once startup finished
    pub fn listen_addrs(&self) -> &[Multiaddr] {
        &self.listen_addrs
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    /// Ping `peer` once; callers needing a deadline should wrap this
    pub async fn ping(&self, peer: PeerId) -> Result<PingExchange, PingError> {
        let mut control = self.handle.stream_control();
        ping::ping(&mut control, peer).await
    }

    /// Wait for `signal`, then shut down
    pub async fn run_until(self, signal: impl Future<Output = ()>) {
        signal.await;
        info!("Shutting down...");
        self.shutdown().await;
    }

    /// Tear everything down in reverse order of acquisition
    pub async fn shutdown(self) {
        let Self {
            handle,
            node_task,
            responder,
            mut discovery,
            reporter,
            ..
        } = self;

        reporter.stop().await;
        discovery.stop().await;

        if let Err(e) = handle.leave_routing().await {
            warn!("Error closing routing service: {}", e);
        }

        responder.abort();
        let _ = responder.await;

        match handle.shutdown().await {
            Ok(()) => {
                if let Err(e) = node_task.await {
                    warn!("Node task ended abnormally: {}", e);
                }
            }
            Err(e) => warn!("Error closing node: {}", e),
        }
        info!("Node {} shut down", handle.local_peer_id());
    }
}

type ConnectedParts = (Vec<Multiaddr>, JoinHandle<()>, Option<(PeerId, Multiaddr)>);

/// Steps whose failure aborts startup once the swarm task is running
///
/// Returns the listen addresses, the ping responder task and the explicitly
/// dialed peer, if any.
async fn connect_phase(
    handle: &NodeHandle,
    config: &NodeConfig,
) -> Result<ConnectedParts, SessionError> {
    let listen_addrs = tokio::time::timeout(config.dial_timeout, handle.listen_addrs())
        .await
        .map_err(|_| NodeError::Timeout(config.dial_timeout))??;

    let responder = ping::serve(handle.stream_control())?;

    let Some(addr) = &config.peer else {
        return Ok((listen_addrs, responder, None));
    };

    let dialed = tokio::time::timeout(config.dial_timeout, handle.dial(addr.clone()))
        .await
        .unwrap_or_else(|_| Err(NodeError::Timeout(config.dial_timeout)));
    match dialed {
        Ok(peer) => {
            info!("Connected to peer {} at {}", peer, addr);
            Ok((listen_addrs, responder, Some((peer, without_peer_id(addr)))))
        }
        Err(source) => {
            responder.abort();
            Err(SessionError::PeerDial {
                addr: addr.clone(),
                source,
            })
        }
    }
}
