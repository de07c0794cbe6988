//! Node configuration

use libp2p::{multiaddr::Protocol, Multiaddr};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Deadline for the explicit startup dial
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for each discovery-triggered connection attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between known-peer reports
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Interface to listen on
    pub listen_host: IpAddr,
    /// Port to listen on (0 for random)
    pub listen_port: u16,
    /// Peer to dial at startup; failure to reach it aborts startup
    pub peer: Option<Multiaddr>,
    /// Directory holding the identity file
    pub data_dir: PathBuf,
    pub dial_timeout: Duration,
    pub connect_timeout: Duration,
    pub report_interval: Duration,
    /// Connections without open streams are closed after this long
    pub idle_connection_timeout: Duration,
    /// Run mDNS discovery
    pub enable_mdns: bool,
    /// Ping every peer reached through discovery
    pub ping_discovered: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            peer: None,
            data_dir: default_data_dir(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            report_interval: DEFAULT_REPORT_INTERVAL,
            idle_connection_timeout: Duration::from_secs(60),
            enable_mdns: true,
            ping_discovered: false,
        }
    }
}

impl NodeConfig {
    /// TCP and QUIC listen addresses on the configured host and port
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        let host = Multiaddr::empty().with(Protocol::from(self.listen_host));
        vec![
            host.clone().with(Protocol::Tcp(self.listen_port)),
            host.with(Protocol::Udp(self.listen_port))
                .with(Protocol::QuicV1),
        ]
    }
}

/// Platform data directory, falling back to the working directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tangle")
}
