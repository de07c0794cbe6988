//! Periodic known-peer report

use libp2p::PeerId;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::network::NodeHandle;

/// Background task logging the known peers on a fixed interval
pub struct PeerReporter {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PeerReporter {
    /// Start reporting every `interval` until [`PeerReporter::stop`]
    pub fn spawn(handle: NodeHandle, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => report(&handle).await,
                }
            }
        });

        Self { stop_tx, task }
    }

    /// Stop the task and wait for it to finish
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Peer reporter ended abnormally: {}", e);
        }
    }
}

async fn report(handle: &NodeHandle) {
    match handle.known_peers().await {
        Ok(peers) => {
            for line in report_lines(&peers, &handle.local_peer_id()) {
                info!("{}", line);
            }
        }
        Err(e) => warn!("Failed to list known peers: {}", e),
    }
}

/// Header plus one line per remote peer; the local peer is left out
pub fn report_lines(peers: &[PeerId], local: &PeerId) -> Vec<String> {
    let remote: Vec<&PeerId> = peers.iter().filter(|p| *p != local).collect();

    let mut lines = Vec::with_capacity(remote.len() + 1);
    lines.push(format!("--- Known peers ({}) ---", remote.len()));
    lines.extend(remote.iter().map(|p| format!(" - {}", p)));
    lines
}
