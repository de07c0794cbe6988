//! tangle node entry point

use clap::Parser;
use libp2p::Multiaddr;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tangle::config::{default_data_dir, NodeConfig};
use tangle::NodeSession;

/// Minimal libp2p node with mDNS and DHT discovery
#[derive(Parser, Debug)]
#[command(name = "tangle", version)]
struct Cli {
    /// Port to listen on (0 = random)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Multiaddress of a peer to connect to at startup
    #[arg(long)]
    peer: Option<Multiaddr>,

    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Directory holding the node identity
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Disable mDNS local discovery
    #[arg(long)]
    no_mdns: bool,

    /// Ping every peer found through local discovery
    #[arg(long)]
    ping_discovered: bool,
}

impl Cli {
    fn into_config(self) -> NodeConfig {
        NodeConfig {
            listen_host: self.host,
            listen_port: self.port,
            peer: self.peer,
            data_dir: self.data_dir.unwrap_or_else(default_data_dir),
            enable_mdns: !self.no_mdns,
            ping_discovered: self.ping_discovered,
            ..NodeConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Cli::parse().into_config();

    let session = match NodeSession::start(config).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    session
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to wait for interrupt signal: {}", e);
            }
        })
        .await;

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Cli::try_parse_from(["tangle"]).unwrap().into_config();
        assert_eq!(config.listen_port, 0);
        assert!(config.peer.is_none());
        assert!(config.enable_mdns);
    }

    #[test]
    fn test_peer_and_port() {
        let cli = Cli::try_parse_from([
            "tangle",
            "--port",
            "9000",
            "--peer",
            "/ip4/192.168.1.10/tcp/9000",
            "--no-mdns",
        ])
        .unwrap();
        let config = cli.into_config();

        assert_eq!(config.listen_port, 9000);
        assert_eq!(
            config.peer.unwrap().to_string(),
            "/ip4/192.168.1.10/tcp/9000"
        );
        assert!(!config.enable_mdns);
    }

    #[test]
    fn test_invalid_peer_rejected() {
        let result = Cli::try_parse_from(["tangle", "--peer", "not-a-multiaddr"]);
        assert!(result.is_err());
    }
}
