//! Ping responder and initiator over libp2p streams

use futures::StreamExt;
use libp2p::PeerId;
use libp2p_stream::Control;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{exchange, respond, PingError, PingExchange, PING_PROTOCOL};

/// Register the ping handler and answer inbound streams until the task is aborted
///
/// Each inbound stream is served on its own task, so a slow or broken peer
/// never holds up the others.
pub fn serve(mut control: Control) -> Result<JoinHandle<()>, PingError> {
    let mut incoming = control
        .accept(PING_PROTOCOL)
        .map_err(|_| PingError::AlreadyServing)?;

    Ok(tokio::spawn(async move {
        while let Some((peer, stream)) = incoming.next().await {
            tokio::spawn(async move {
                match respond(stream).await {
                    Ok(request) => info!("Received {:?} from {}", request, peer),
                    Err(e) => warn!("Error serving ping from {}: {}", peer, e),
                }
            });
        }
        debug!("Ping responder stopped");
    }))
}

/// Ping `peer` once and return the exchange
///
/// Opens a fresh stream, dialing the peer if needed. No retry and no timeout:
/// callers that need a deadline wrap this call.
pub async fn ping(control: &mut Control, peer: PeerId) -> Result<PingExchange, PingError> {
    let stream = control
        .open_stream(peer, PING_PROTOCOL)
        .await
        .map_err(|e| PingError::Dial {
            peer,
            reason: e.to_string(),
        })?;

    let exchange = exchange(stream).await?;
    info!(
        "Sent ping to {} -> got {:?} (rtt={:?})",
        peer, exchange.response, exchange.rtt
    );
    Ok(exchange)
}
