use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

use tangle::identity::identity_path;
use tangle::{DiscoveryState, NodeConfig, NodeError, NodeSession, SessionError};

fn local_config(dir: &Path) -> NodeConfig {
    NodeConfig {
        listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
        data_dir: dir.to_path_buf(),
        dial_timeout: Duration::from_secs(5),
        report_interval: Duration::from_secs(1),
        enable_mdns: false,
        ..NodeConfig::default()
    }
}

async fn wait_until_known(session: &NodeSession, peer: PeerId) {
    loop {
        let known = session.handle().known_peers().await.unwrap();
        if known.contains(&peer) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn dialable(session: &NodeSession) -> Multiaddr {
    let addrs = session.listen_addrs();
    let addr = addrs
        .iter()
        .find(|a| a.iter().any(|p| matches!(p, Protocol::Tcp(_))))
        .or_else(|| addrs.first())
        .unwrap()
        .clone();
    addr.with(Protocol::P2p(session.local_peer_id()))
}

#[tokio::test]
async fn test_two_nodes_ping() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let b = NodeSession::start(local_config(dir_b.path())).await.unwrap();
    let a = NodeSession::start(NodeConfig {
        peer: Some(dialable(&b)),
        ..local_config(dir_a.path())
    })
    .await
    .unwrap();

    let exchange = tokio::time::timeout(Duration::from_secs(10), a.ping(b.local_peer_id()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exchange.response, "pong");
    assert!(exchange.rtt > Duration::ZERO);

    let known = a.handle().known_peers().await.unwrap();
    assert!(known.contains(&b.local_peer_id()));
    assert!(!known.contains(&a.local_peer_id()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_identity_survives_restart() {
    let dir = tempdir().unwrap();

    let first = NodeSession::start(local_config(dir.path())).await.unwrap();
    let peer_id = first.local_peer_id();
    first.shutdown().await;

    let second = NodeSession::start(local_config(dir.path())).await.unwrap();
    assert_eq!(second.local_peer_id(), peer_id);
    second.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_peer_is_fatal() {
    let dir = tempdir().unwrap();
    let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/1/p2p/{}", PeerId::random())
        .parse()
        .unwrap();

    let result = NodeSession::start(NodeConfig {
        peer: Some(addr),
        ..local_config(dir.path())
    })
    .await;

    assert!(matches!(result, Err(SessionError::PeerDial { .. })));
}

#[tokio::test]
async fn test_corrupt_identity_is_fatal() {
    let dir = tempdir().unwrap();
    std::fs::write(identity_path(dir.path()), b"not json").unwrap();

    let result = NodeSession::start(local_config(dir.path())).await;

    assert!(matches!(result, Err(SessionError::Identity(_))));
    assert_eq!(std::fs::read(identity_path(dir.path())).unwrap(), b"not json");
}

#[tokio::test]
async fn test_discovery_idle_when_disabled() {
    let dir = tempdir().unwrap();

    let session = NodeSession::start(local_config(dir.path())).await.unwrap();
    assert_eq!(session.discovery_state(), DiscoveryState::Idle);

    session.shutdown().await;
}

#[tokio::test]
async fn test_port_in_use_is_fatal() {
    let dir = tempdir().unwrap();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let result = NodeSession::start(NodeConfig {
        listen_port: port,
        ..local_config(dir.path())
    })
    .await;

    match result {
        Err(SessionError::Startup(NodeError::Listen { addr, reason })) => {
            assert!(addr.to_string().ends_with(&format!("/tcp/{}", port)));
            assert!(!reason.is_empty());
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("started on an occupied port"),
    }
}

#[tokio::test]
async fn test_local_discovery_then_ping() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let mdns_config = |dir: &Path| NodeConfig {
        listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        enable_mdns: true,
        ..local_config(dir)
    };

    let a = NodeSession::start(mdns_config(dir_a.path())).await.unwrap();
    let b = NodeSession::start(mdns_config(dir_b.path())).await.unwrap();
    assert_eq!(a.discovery_state(), DiscoveryState::Active);
    assert_eq!(b.discovery_state(), DiscoveryState::Active);

    tokio::time::timeout(Duration::from_secs(15), async {
        wait_until_known(&a, b.local_peer_id()).await;
        wait_until_known(&b, a.local_peer_id()).await;
    })
    .await
    .expect("nodes did not find each other over mDNS");

    let exchange = tokio::time::timeout(Duration::from_secs(10), a.ping(b.local_peer_id()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exchange.response, "pong");
    assert!(exchange.rtt > Duration::ZERO);

    a.shutdown().await;
    b.shutdown().await;
}
