//! P2P Node implementation
//!
//! The swarm lives on a single task ([`Node::run`]); everything else talks to
//! it through a cloneable [`NodeHandle`].

use futures::StreamExt;
use libp2p::{
    identify,
    identity::Keypair,
    kad, mdns, noise,
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        ConnectionId, SwarmEvent,
    },
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::behaviour::{NodeBehaviour, NodeBehaviourEvent};
use super::record::{peer_id_of, PeerRecord};
use crate::config::NodeConfig;

const COMMAND_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Failed to listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },
    #[error("Dial error: {0}")]
    Dial(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Routing bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("Discovery error: {0}")]
    Discovery(String),
    #[error("Node event loop is not running")]
    Stopped,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Dial {
        peer: Option<PeerId>,
        addrs: Vec<Multiaddr>,
        reply: Reply<Result<PeerId, NodeError>>,
    },
    KnownPeers {
        reply: Reply<Vec<PeerId>>,
    },
    ListenAddrs {
        reply: Reply<Vec<Multiaddr>>,
    },
    JoinRouting {
        bootstrap: Vec<(PeerId, Multiaddr)>,
        reply: Reply<Result<(), NodeError>>,
    },
    LeaveRouting {
        reply: Reply<()>,
    },
    StartDiscovery {
        events: mpsc::Sender<PeerRecord>,
        reply: Reply<Result<(), NodeError>>,
    },
    StopDiscovery {
        reply: Reply<()>,
    },
    Shutdown,
}

/// Cloneable handle to a running [`Node`]
///
/// Safe to share between tasks; every call is a message to the swarm task.
#[derive(Clone)]
pub struct NodeHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
}

impl NodeHandle {
    /// Get local peer ID
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Control for opening and accepting application streams
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    /// Dial an address and wait until the connection is established
    ///
    /// A trailing `/p2p/<id>` component pins the expected peer. Returns the
    /// peer ID of the remote.
    pub async fn dial(&self, addr: Multiaddr) -> Result<PeerId, NodeError> {
        let peer = peer_id_of(&addr);
        self.request(|reply| Command::Dial {
            peer,
            addrs: vec![addr],
            reply,
        })
        .await?
    }

    /// Connect to a discovered peer, reusing an existing connection if any
    pub async fn connect(&self, record: &PeerRecord) -> Result<(), NodeError> {
        let peer = Some(record.peer_id);
        let addrs = record.addrs.clone();
        self.request(|reply| Command::Dial { peer, addrs, reply })
            .await?
            .map(|_| ())
    }

    /// Every remote peer the node has an address for or a connection to
    pub async fn known_peers(&self) -> Result<Vec<PeerId>, NodeError> {
        self.request(|reply| Command::KnownPeers { reply }).await
    }

    /// Current listen addresses; waits for the first one if none is up yet
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, NodeError> {
        self.request(|reply| Command::ListenAddrs { reply }).await
    }

    /// Switch the DHT to server mode, seed it and start a bootstrap
    pub async fn join_routing(
        &self,
        bootstrap: Vec<(PeerId, Multiaddr)>,
    ) -> Result<(), NodeError> {
        self.request(|reply| Command::JoinRouting { bootstrap, reply })
            .await?
    }

    /// Stop serving the DHT and forget its routing table
    pub async fn leave_routing(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::LeaveRouting { reply }).await
    }

    /// Push every peer found by mDNS into `events`
    ///
    /// Fails when mDNS was disabled in the config or could not be created.
    pub async fn start_discovery(
        &self,
        events: mpsc::Sender<PeerRecord>,
    ) -> Result<(), NodeError> {
        self.request(|reply| Command::StartDiscovery { events, reply })
            .await?
    }

    /// Stop forwarding mDNS discoveries
    pub async fn stop_discovery(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::StopDiscovery { reply }).await
    }

    /// Ask the swarm task to exit, closing all listeners and connections
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| NodeError::Stopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, NodeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| NodeError::Stopped)?;
        response.await.map_err(|_| NodeError::Stopped)
    }
}

/// P2P Node
pub struct Node {
    swarm: Swarm<NodeBehaviour>,
    commands: mpsc::Receiver<Command>,
    local_peer_id: PeerId,
    /// Addresses of every remote peer seen so far
    peer_book: HashMap<PeerId, HashSet<Multiaddr>>,
    listen_addrs: Vec<Multiaddr>,
    listen_waiters: Vec<Reply<Vec<Multiaddr>>>,
    pending_dials: HashMap<ConnectionId, Reply<Result<PeerId, NodeError>>>,
    discovery_tx: Option<mpsc::Sender<PeerRecord>>,
}

impl Node {
    /// Build the swarm and start listening on the configured addresses
    pub fn bind(keypair: Keypair, config: &NodeConfig) -> Result<(Self, NodeHandle), NodeError> {
        let local_peer_id = PeerId::from(keypair.public());
        let local_public_key = keypair.public();
        let idle_timeout = config.idle_connection_timeout;
        let enable_mdns = config.enable_mdns;

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_quic()
            .with_behaviour(|_| {
                NodeBehaviour::new(local_peer_id, local_public_key, enable_mdns)
            })
            .map_err(|e| NodeError::Transport(e.to_string()))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
            .build();

        for addr in config.listen_addrs() {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| NodeError::Listen {
                    addr,
                    reason: error_chain(&e),
                })?;
        }

        let control = swarm.behaviour().streams.new_control();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let node = Self {
            swarm,
            commands: command_rx,
            local_peer_id,
            peer_book: HashMap::new(),
            listen_addrs: Vec::new(),
            listen_waiters: Vec::new(),
            pending_dials: HashMap::new(),
            discovery_tx: None,
        };
        let handle = NodeHandle {
            local_peer_id,
            commands: command_tx,
            control,
        };

        Ok((node, handle))
    }

    /// Get local peer ID
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Run the node event loop until shutdown or until every handle is gone
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }
        info!("Node {} stopped", self.local_peer_id);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, addrs, reply } => self.dial(peer, addrs, reply),
            Command::KnownPeers { reply } => {
                let _ = reply.send(self.known_peers());
            }
            Command::ListenAddrs { reply } => {
                if self.listen_addrs.is_empty() {
                    self.listen_waiters.push(reply);
                } else {
                    let _ = reply.send(self.listen_addrs.clone());
                }
            }
            Command::JoinRouting { bootstrap, reply } => {
                let _ = reply.send(self.join_routing(bootstrap));
            }
            Command::LeaveRouting { reply } => {
                self.leave_routing();
                let _ = reply.send(());
            }
            Command::StartDiscovery { events, reply } => {
                let _ = reply.send(self.start_discovery(events));
            }
            Command::StopDiscovery { reply } => {
                self.stop_discovery();
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn dial(
        &mut self,
        peer: Option<PeerId>,
        addrs: Vec<Multiaddr>,
        reply: Reply<Result<PeerId, NodeError>>,
    ) {
        let opts = match peer {
            Some(peer_id) if self.swarm.is_connected(&peer_id) => {
                let _ = reply.send(Ok(peer_id));
                return;
            }
            Some(peer_id) => DialOpts::peer_id(peer_id)
                .addresses(addrs)
                .condition(PeerCondition::Always)
                .build(),
            None => match addrs.into_iter().next() {
                Some(addr) => DialOpts::unknown_peer_id().address(addr).build(),
                None => {
                    let _ = reply.send(Err(NodeError::Dial("no address to dial".to_string())));
                    return;
                }
            },
        };

        let connection_id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(connection_id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(NodeError::Dial(e.to_string())));
            }
        }
    }

    fn known_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peer_book
            .keys()
            .chain(self.swarm.connected_peers())
            .filter(|peer| **peer != self.local_peer_id)
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        peers.sort();
        peers
    }

    fn remember(&mut self, peer_id: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
        if peer_id == self.local_peer_id {
            return;
        }
        self.peer_book.entry(peer_id).or_default().extend(addrs);
    }

    fn join_routing(&mut self, bootstrap: Vec<(PeerId, Multiaddr)>) -> Result<(), NodeError> {
        let kademlia = &mut self.swarm.behaviour_mut().kademlia;
        kademlia.set_mode(Some(kad::Mode::Server));
        for (peer_id, addr) in bootstrap {
            kademlia.add_address(&peer_id, addr);
        }

        let query = kademlia
            .bootstrap()
            .map_err(|e| NodeError::Bootstrap(e.to_string()))?;
        debug!("Started Kademlia bootstrap {:?}", query);
        Ok(())
    }

    fn leave_routing(&mut self) {
        let kademlia = &mut self.swarm.behaviour_mut().kademlia;
        kademlia.set_mode(Some(kad::Mode::Client));

        let mut peers = Vec::new();
        for bucket in kademlia.kbuckets() {
            for entry in bucket.iter() {
                peers.push(*entry.node.key.preimage());
            }
        }
        for peer in &peers {
            kademlia.remove_peer(peer);
        }
        debug!("Left routing, dropped {} routing entries", peers.len());
    }

    fn start_discovery(&mut self, events: mpsc::Sender<PeerRecord>) -> Result<(), NodeError> {
        if !self.swarm.behaviour().mdns.is_enabled() {
            return Err(NodeError::Discovery("mDNS is not running".to_string()));
        }
        if self.discovery_tx.replace(events).is_none() {
            info!("mDNS discovery started");
        }
        Ok(())
    }

    fn stop_discovery(&mut self) {
        if self.discovery_tx.take().is_some() {
            info!("mDNS discovery stopped");
        }
    }

    /// Handle swarm events
    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}/p2p/{}", address, self.local_peer_id);
                self.listen_addrs.push(address);
                for waiter in self.listen_waiters.drain(..) {
                    let _ = waiter.send(self.listen_addrs.clone());
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.retain(|a| *a != address);
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!("Listener error: {}", error);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                info!("Connected to {}", peer_id);
                let addrs = endpoint
                    .is_dialer()
                    .then(|| endpoint.get_remote_address().clone());
                self.remember(peer_id, addrs);
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(peer_id));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                debug!("Outgoing connection to {:?} failed: {}", peer_id, error);
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(NodeError::Dial(error.to_string())));
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("Disconnected from {} ({:?})", peer_id, cause);
            }
            SwarmEvent::Behaviour(behaviour_event) => {
                self.handle_behaviour_event(behaviour_event);
            }
            _ => {}
        }
    }

    /// Handle behaviour events
    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Kademlia(kad_event) => self.handle_kad_event(kad_event),
            NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!("Identified peer {}: {:?}", peer_id, info.protocols);
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                self.remember(peer_id, info.listen_addrs);
            }
            NodeBehaviourEvent::Identify(_) => {}
            NodeBehaviourEvent::Mdns(mdns_event) => self.handle_mdns_event(mdns_event),
            NodeBehaviourEvent::Streams(()) => {}
        }
    }

    fn handle_mdns_event(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(list) => {
                for record in PeerRecord::group(list) {
                    for addr in &record.addrs {
                        self.swarm
                            .behaviour_mut()
                            .kademlia
                            .add_address(&record.peer_id, addr.clone());
                    }
                    self.remember(record.peer_id, record.addrs.iter().cloned());

                    let Some(events) = self.discovery_tx.clone() else {
                        continue;
                    };
                    // The subscriber may lag; never block the swarm on it
                    tokio::spawn(async move {
                        if events.send(record).await.is_err() {
                            debug!("Discovery subscriber went away");
                        }
                    });
                }
            }
            mdns::Event::Expired(list) => {
                for (peer_id, addr) in list {
                    debug!("mDNS record expired: {} at {}", peer_id, addr);
                    let connected = self.swarm.is_connected(&peer_id);
                    if forget(&mut self.peer_book, &peer_id, &addr, connected) {
                        debug!("Forgot peer {}", peer_id);
                    }
                }
            }
        }
    }

    /// Handle Kademlia events
    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                debug!("Kademlia routing updated for {}", peer);
                self.remember(peer, addresses.iter().cloned());
            }
            kad::Event::OutboundQueryProgressed {
                result: kad::QueryResult::Bootstrap(result),
                step,
                ..
            } => match result {
                Ok(kad::BootstrapOk { peer, num_remaining }) => {
                    debug!(
                        "Bootstrap step {:?}: reached {}, {} remaining",
                        step.count, peer, num_remaining
                    );
                }
                Err(e) => warn!("DHT bootstrap warning: {:?}", e),
            },
            _ => {}
        }
    }
}

/// Drop an expired address from the peer book
///
/// A peer left with no address is removed unless it is still connected.
/// Returns whether the peer was removed.
fn forget(
    peer_book: &mut HashMap<PeerId, HashSet<Multiaddr>>,
    peer_id: &PeerId,
    addr: &Multiaddr,
    connected: bool,
) -> bool {
    let Some(addrs) = peer_book.get_mut(peer_id) else {
        return false;
    };
    addrs.remove(addr);
    if addrs.is_empty() && !connected {
        peer_book.remove(peer_id);
        return true;
    }
    false
}

/// Render an error with its whole `source()` chain
///
/// Some transport errors have an empty `Display` and keep the cause in their
/// source.
fn error_chain(err: &dyn StdError) -> String {
    let mut parts = Vec::new();
    let mut current = Some(err);
    while let Some(e) = current {
        let msg = e.to_string();
        if !msg.is_empty() && parts.last() != Some(&msg) {
            parts.push(msg);
        }
        current = e.source();
    }
    if parts.is_empty() {
        format!("{:?}", err)
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Error, Debug)]
    #[error("")]
    struct Silent(#[source] io::Error);

    fn book(peer_id: PeerId, addrs: &[&str]) -> HashMap<PeerId, HashSet<Multiaddr>> {
        let addrs: HashSet<Multiaddr> = addrs.iter().map(|a| a.parse().unwrap()).collect();
        HashMap::from([(peer_id, addrs)])
    }

    #[test]
    fn test_forget_keeps_remaining_addrs() {
        let peer = PeerId::random();
        let tcp: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        let mut peer_book = book(peer, &["/ip4/10.0.0.1/tcp/1", "/ip4/10.0.0.1/udp/1/quic-v1"]);

        assert!(!forget(&mut peer_book, &peer, &tcp, false));
        assert_eq!(peer_book[&peer].len(), 1);
        assert!(!peer_book[&peer].contains(&tcp));
    }

    #[test]
    fn test_forget_drops_peer_without_addrs() {
        let peer = PeerId::random();
        let tcp: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        let mut peer_book = book(peer, &["/ip4/10.0.0.1/tcp/1"]);

        assert!(forget(&mut peer_book, &peer, &tcp, false));
        assert!(peer_book.is_empty());
    }

    #[test]
    fn test_forget_keeps_connected_peer() {
        let peer = PeerId::random();
        let tcp: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        let mut peer_book = book(peer, &["/ip4/10.0.0.1/tcp/1"]);

        assert!(!forget(&mut peer_book, &peer, &tcp, true));
        assert!(peer_book.contains_key(&peer));
    }

    #[test]
    fn test_error_chain_skips_empty_display() {
        let err = Silent(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
        assert_eq!(error_chain(&err), "address in use");
    }

    #[tokio::test]
    async fn test_start_discovery_fails_without_mdns() {
        let config = NodeConfig {
            listen_host: std::net::Ipv4Addr::LOCALHOST.into(),
            enable_mdns: false,
            ..NodeConfig::default()
        };
        let (node, handle) = Node::bind(Keypair::generate_ed25519(), &config).unwrap();
        let task = tokio::spawn(node.run());

        let (tx, _rx) = mpsc::channel(1);
        let result = handle.start_discovery(tx).await;
        assert!(matches!(result, Err(NodeError::Discovery(_))));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_discovery_with_mdns() {
        let config = NodeConfig {
            listen_host: std::net::Ipv4Addr::LOCALHOST.into(),
            ..NodeConfig::default()
        };
        let (node, handle) = Node::bind(Keypair::generate_ed25519(), &config).unwrap();
        let task = tokio::spawn(node.run());

        let (tx, _rx) = mpsc::channel(1);
        handle.start_discovery(tx.clone()).await.unwrap();
        // Subscribing twice is harmless
        handle.start_discovery(tx).await.unwrap();
        handle.stop_discovery().await.unwrap();

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
