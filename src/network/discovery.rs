//! Local discovery coordination
//!
//! mDNS notifications arrive as [`PeerRecord`] messages on a channel. The
//! coordinator turns each one into an independent, deadline-bounded connection
//! attempt. A failed attempt is logged and never stops the notification loop.

use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::node::{NodeError, NodeHandle};
use super::ping;
use super::protocol::PingError;
use super::record::PeerRecord;
use crate::config::DEFAULT_CONNECT_TIMEOUT;

const NOTIFICATION_BUFFER: usize = 64;

/// What the coordinator needs from the network
#[async_trait]
pub trait DiscoveryTransport: Clone + Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Start announcing and push discovered peers into `events`
    async fn start_discovery(&self, events: mpsc::Sender<PeerRecord>) -> Result<(), NodeError>;

    async fn stop_discovery(&self) -> Result<(), NodeError>;

    async fn connect(&self, record: &PeerRecord) -> Result<(), NodeError>;

    /// Ping a connected peer, returning the round-trip time
    async fn ping(&self, peer: PeerId) -> Result<Duration, PingError>;
}

#[async_trait]
impl DiscoveryTransport for NodeHandle {
    fn local_peer_id(&self) -> PeerId {
        NodeHandle::local_peer_id(self)
    }

    async fn start_discovery(&self, events: mpsc::Sender<PeerRecord>) -> Result<(), NodeError> {
        NodeHandle::start_discovery(self, events).await
    }

    async fn stop_discovery(&self) -> Result<(), NodeError> {
        NodeHandle::stop_discovery(self).await
    }

    async fn connect(&self, record: &PeerRecord) -> Result<(), NodeError> {
        NodeHandle::connect(self, record).await
    }

    async fn ping(&self, peer: PeerId) -> Result<Duration, PingError> {
        let mut control = self.stream_control();
        ping::ping(&mut control, peer).await.map(|exchange| exchange.rtt)
    }
}

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Deadline for each connection attempt
    pub connect_timeout: Duration,
    /// Ping each peer once its connection is up
    pub ping_discovered: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_discovered: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Active,
}

struct ActiveDiscovery {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Drives connection attempts from discovery notifications
pub struct DiscoveryCoordinator<T: DiscoveryTransport> {
    transport: T,
    config: DiscoveryConfig,
    active: Option<ActiveDiscovery>,
}

impl<T: DiscoveryTransport> DiscoveryCoordinator<T> {
    pub fn new(transport: T, config: DiscoveryConfig) -> Self {
        Self {
            transport,
            config,
            active: None,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        if self.active.is_some() {
            DiscoveryState::Active
        } else {
            DiscoveryState::Idle
        }
    }

    /// Subscribe to discovery notifications; no-op when already active
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.active.is_some() {
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        self.transport.start_discovery(events_tx).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(notification_loop(
            self.transport.clone(),
            self.config.clone(),
            events_rx,
            stop_rx,
        ));
        self.active = Some(ActiveDiscovery { stop_tx, task });
        Ok(())
    }

    /// Release discovery resources; no-op when idle
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let _ = active.stop_tx.send(());
        if let Err(e) = self.transport.stop_discovery().await {
            warn!("Error stopping discovery: {}", e);
        }
        if let Err(e) = active.task.await {
            warn!("Discovery task ended abnormally: {}", e);
        }
    }
}

async fn notification_loop<T: DiscoveryTransport>(
    transport: T,
    config: DiscoveryConfig,
    mut events: mpsc::Receiver<PeerRecord>,
    mut stop: oneshot::Receiver<()>,
) {
    let in_flight: Arc<Mutex<HashSet<PeerId>>> = Arc::default();
    let local_peer_id = transport.local_peer_id();

    loop {
        let record = tokio::select! {
            _ = &mut stop => break,
            record = events.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        if record.peer_id == local_peer_id {
            debug!("Ignoring own discovery announcement");
            continue;
        }
        if !claim(&in_flight, record.peer_id) {
            debug!("Connection to {} already in progress", record.peer_id);
            continue;
        }

        info!("mDNS discovered: {}", record.peer_id);
        tokio::spawn(connect_to(
            transport.clone(),
            config.clone(),
            record,
            in_flight.clone(),
        ));
    }
    debug!("Discovery notification loop stopped");
}

/// Mark `peer` as being connected to; false if it already was
fn claim(in_flight: &Mutex<HashSet<PeerId>>, peer: PeerId) -> bool {
    match in_flight.lock() {
        Ok(mut peers) => peers.insert(peer),
        Err(poisoned) => poisoned.into_inner().insert(peer),
    }
}

fn release(in_flight: &Mutex<HashSet<PeerId>>, peer: &PeerId) {
    match in_flight.lock() {
        Ok(mut peers) => peers.remove(peer),
        Err(poisoned) => poisoned.into_inner().remove(peer),
    };
}

async fn connect_to<T: DiscoveryTransport>(
    transport: T,
    config: DiscoveryConfig,
    record: PeerRecord,
    in_flight: Arc<Mutex<HashSet<PeerId>>>,
) {
    let peer = record.peer_id;
    let result = tokio::time::timeout(config.connect_timeout, transport.connect(&record))
        .await
        .unwrap_or_else(|_| Err(NodeError::Timeout(config.connect_timeout)));
    release(&in_flight, &peer);

    if let Err(e) = result {
        warn!("Error connecting to discovered peer {}: {}", peer, e);
        return;
    }

    if config.ping_discovered {
        match transport.ping(peer).await {
            Ok(rtt) => info!("Discovered peer {} answered ping in {:?}", peer, rtt),
            Err(e) => warn!("Ping to discovered peer {} failed: {}", peer, e),
        }
    }
}
