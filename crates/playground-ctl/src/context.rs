//! Shared bring-up for the network-facing commands.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use playground_net::discovery::{DiscoveryService, NodeIdentity, NodeRegistry, NODE_TIMEOUT};
use playground_net::protocol::client::RetryPolicy;
use playground_net::{HostConfig, Keypair, PeerHost};

use crate::config::ControllerConfig;

/// A connected controller: ephemeral host identity plus discovery.
pub struct ControllerContext {
    /// Loaded configuration.
    pub config: ControllerConfig,

    /// The controller's peer host.
    pub host: Arc<PeerHost>,

    /// Discovery service feeding the node registry.
    pub discovery: DiscoveryService,
}

impl ControllerContext {
    /// Bring up the controller host and start discovery.
    pub async fn connect(config: ControllerConfig) -> Result<Self> {
        let psk = if config.security.enable_auth {
            config.security.psk.clone()
        } else {
            None
        };

        let host = PeerHost::new(
            Keypair::generate_ed25519(),
            HostConfig {
                listen_addrs: config.node.listen_addrs.clone(),
                psk,
                bootstrap_peers: config.node.bootstrap_peers.clone(),
                enable_mdns: config.node.enable_mdns,
                dht_mode: config.node.dht_mode,
                ..HostConfig::default()
            },
        )
        .await
        .context("failed to create P2P host")?;

        let registry = Arc::new(NodeRegistry::new(NODE_TIMEOUT));
        let discovery = DiscoveryService::new(
            Arc::clone(&host),
            registry,
            NodeIdentity {
                name: "controller".to_string(),
                labels: Default::default(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );
        discovery.start()?;

        Ok(Self {
            config,
            host,
            discovery,
        })
    }

    /// Resolve deployment targets: an explicit `--node`, or every peer
    /// discovered after a short settle period.
    pub async fn resolve_targets(&self, node: Option<String>) -> Result<Vec<String>> {
        if let Some(node) = node {
            println!("Using specified node: {node}");
            return Ok(vec![node]);
        }

        tokio::time::sleep(self.config.deployment.discovery_wait).await;
        let peers = self.host.peers().await;
        if peers.is_empty() {
            bail!("no nodes discovered");
        }

        println!("\nDiscovered {} node(s):", peers.len());
        for (index, peer) in peers.iter().enumerate() {
            println!("{}. Peer ID: {}", index + 1, peer.id);
            for addr in &peer.addrs {
                println!("     - {addr}");
            }
        }
        Ok(peers.into_iter().map(|peer| peer.id).collect())
    }

    /// Retry policy from the deployment section.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.deployment.retry_attempts,
            delay: self.config.deployment.retry_delay,
        }
    }

    /// Tear the host down.
    pub async fn close(&self) {
        self.discovery.stop();
        self.host.close().await;
    }
}

/// First 8 characters of a peer id, used to tag log lines.
#[must_use]
pub fn short_peer_id(peer_id: &str) -> &str {
    &peer_id[..peer_id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_eight_chars() {
        assert_eq!(short_peer_id("12D3KooWAbCdEf"), "12D3KooW");
        assert_eq!(short_peer_id("short"), "short");
    }
}
