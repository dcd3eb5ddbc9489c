use anyhow::{anyhow, Result};
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of candidate storage hosts. An error means no host is currently available.
#[async_trait]
pub trait HostProvider: Send + Sync {
    async fn next_valid_host(&self) -> Result<String>;
}

/// Round-robin over a fixed host list.
pub struct StaticHostProvider {
    hosts: Vec<String>,
    cursor: AtomicUsize,
}

impl StaticHostProvider {
    pub fn new(hosts: &[String]) -> Self {
        let mut unique: Vec<String> = Vec::new();
        for host in hosts {
            let key = host_identity_key(host);
            if !unique.iter().any(|h| host_identity_key(h) == key) {
                unique.push(host.trim().to_string());
            }
        }
        Self {
            hosts: unique,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[async_trait]
impl HostProvider for StaticHostProvider {
    async fn next_valid_host(&self) -> Result<String> {
        if self.hosts.is_empty() {
            return Err(anyhow!("no valid host available"));
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        Ok(self.hosts[idx].clone())
    }
}

/// Accepts a bare peer id or a multiaddr carrying a `/p2p/` component.
pub fn parse_host_id(host: &str) -> Result<PeerId> {
    let host = host.trim();
    if let Ok(peer_id) = host.parse::<PeerId>() {
        return Ok(peer_id);
    }
    let ma: Multiaddr = host
        .parse()
        .map_err(|e| anyhow!("host is neither a peer id nor a multiaddr: {e}"))?;
    peer_id_from_multiaddr(&ma).ok_or_else(|| anyhow!("host addr missing /p2p/ peer id: {host}"))
}

pub fn peer_id_from_multiaddr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

fn host_identity_key(value: &str) -> String {
    match parse_host_id(value) {
        Ok(peer_id) => peer_id.to_string(),
        Err(_) => value.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_peer_ids_and_multiaddrs() {
        let peer = PeerId::random();
        assert_eq!(parse_host_id(&peer.to_string()).unwrap(), peer);
        let addr = format!("/ip4/127.0.0.1/tcp/9000/p2p/{peer}");
        assert_eq!(parse_host_id(&addr).unwrap(), peer);
        assert!(parse_host_id("/ip4/127.0.0.1/tcp/9000").is_err());
        assert!(parse_host_id("not-a-host").is_err());
    }

    #[tokio::test]
    async fn round_robin_over_deduplicated_hosts() {
        let a = PeerId::random();
        let b = PeerId::random();
        let hosts = vec![
            a.to_string(),
            format!("/ip4/10.0.0.1/tcp/9000/p2p/{a}"),
            b.to_string(),
        ];
        let provider = StaticHostProvider::new(&hosts);
        assert_eq!(provider.len(), 2);

        let first = provider.next_valid_host().await.unwrap();
        let second = provider.next_valid_host().await.unwrap();
        let third = provider.next_valid_host().await.unwrap();
        assert_eq!(first, a.to_string());
        assert_eq!(second, b.to_string());
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn empty_provider_reports_no_host() {
        let provider = StaticHostProvider::new(&[]);
        assert!(provider.is_empty());
        assert!(provider.next_valid_host().await.is_err());
    }
}
