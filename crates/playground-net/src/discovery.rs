//! Node discovery over the gossip overlay.
//!
//! Every node publishes a JSON [`NodeAnnouncement`] on the discovery topic
//! every [`ANNOUNCE_INTERVAL`]. Receivers keep a `peer_id -> DiscoveredNode`
//! map with `last_seen` refreshed on each announcement; a sweeper evicts
//! entries older than [`NODE_TIMEOUT`]. Callbacks never run under the map
//! lock; they are dispatched onto worker tasks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use playground_core::Result;

use crate::host::PeerHost;

/// Gossip topic carrying node announcements.
pub const DISCOVERY_TOPIC: &str = "p2p-playground/discovery";

/// How often nodes announce themselves.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);

/// How long before a silent node is considered offline.
pub const NODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Announcement broadcast by every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    /// Announcing peer id.
    pub peer_id: String,

    /// Human-readable node name.
    pub name: String,

    /// Node labels.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    /// Listen addresses.
    pub addrs: Vec<String>,

    /// Daemon version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Unix timestamp of the announcement.
    pub timestamp: i64,
}

/// A currently-known remote node.
#[derive(Debug, Clone)]
pub struct DiscoveredNode {
    /// Peer id.
    pub peer_id: String,

    /// Human-readable node name.
    pub name: String,

    /// Node labels.
    pub labels: HashMap<String, String>,

    /// Listen addresses.
    pub addrs: Vec<String>,

    /// Daemon version.
    pub version: String,

    /// When the last announcement arrived.
    pub last_seen: Instant,
}

type DiscoveredCallback = Arc<dyn Fn(DiscoveredNode) + Send + Sync>;
type LostCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Map of known nodes with stale eviction and change callbacks.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, DiscoveredNode>>,
    timeout: Duration,
    on_discovered: Option<DiscoveredCallback>,
    on_lost: Option<LostCallback>,
}

impl NodeRegistry {
    /// Create a registry evicting nodes silent for longer than `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            timeout,
            on_discovered: None,
            on_lost: None,
        }
    }

    /// Invoke `callback` on the first sighting of each node.
    #[must_use]
    pub fn on_discovered<F>(mut self, callback: F) -> Self
    where
        F: Fn(DiscoveredNode) + Send + Sync + 'static,
    {
        self.on_discovered = Some(Arc::new(callback));
        self
    }

    /// Invoke `callback` when a node is evicted.
    #[must_use]
    pub fn on_lost<F>(mut self, callback: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.on_lost = Some(Arc::new(callback));
        self
    }

    /// Record an announcement, refreshing `last_seen`.
    pub fn observe(&self, announcement: NodeAnnouncement) {
        let node = DiscoveredNode {
            peer_id: announcement.peer_id,
            name: announcement.name,
            labels: announcement.labels,
            addrs: announcement.addrs,
            version: announcement.version,
            last_seen: Instant::now(),
        };

        let is_new = {
            let mut nodes = self.nodes.write().unwrap();
            nodes.insert(node.peer_id.clone(), node.clone()).is_none()
        };

        if is_new {
            info!(peer = %node.peer_id, name = %node.name, "discovered new node");
            if let Some(callback) = self.on_discovered.clone() {
                tokio::spawn(async move { callback(node) });
            }
        }
    }

    /// Evict every node whose last announcement is older than the timeout.
    pub fn sweep(&self) {
        let expired: Vec<String> = {
            let mut nodes = self.nodes.write().unwrap();
            let timeout = self.timeout;
            let dead: Vec<String> = nodes
                .iter()
                .filter(|(_, node)| node.last_seen.elapsed() > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &dead {
                nodes.remove(id);
            }
            dead
        };

        for peer_id in expired {
            info!(peer = %peer_id, "node lost");
            if let Some(callback) = self.on_lost.clone() {
                let id = peer_id.clone();
                tokio::spawn(async move { callback(id) });
            }
        }
    }

    /// Snapshot of all known nodes.
    #[must_use]
    pub fn nodes(&self) -> Vec<DiscoveredNode> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    /// Look up one node.
    #[must_use]
    pub fn get(&self, peer_id: &str) -> Option<DiscoveredNode> {
        self.nodes.read().unwrap().get(peer_id).cloned()
    }
}

/// Identity advertised in this node's announcements.
#[derive(Debug, Clone, Default)]
pub struct NodeIdentity {
    /// Human-readable node name.
    pub name: String,

    /// Node labels.
    pub labels: HashMap<String, String>,

    /// Daemon version.
    pub version: String,
}

/// Wires the announce loop, the gossip listener and the sweeper together.
pub struct DiscoveryService {
    host: Arc<PeerHost>,
    registry: Arc<NodeRegistry>,
    identity: NodeIdentity,
    stop: watch::Sender<bool>,
}

impl DiscoveryService {
    /// Create a service bound to a host and a registry.
    #[must_use]
    pub fn new(host: Arc<PeerHost>, registry: Arc<NodeRegistry>, identity: NodeIdentity) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            host,
            registry,
            identity,
            stop,
        }
    }

    /// Start the background loops.
    ///
    /// # Errors
    ///
    /// Fails when the host's gossip receiver was already claimed.
    pub fn start(&self) -> Result<()> {
        let mut gossip = self.host.take_gossip_messages()?;

        // Listener: gossip announcements into the registry.
        let registry = Arc::clone(&self.registry);
        let own_id = self.host.id();
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    message = gossip.recv() => {
                        let Some(message) = message else { return };
                        match serde_json::from_slice::<NodeAnnouncement>(&message.data) {
                            Ok(announcement) if announcement.peer_id != own_id => {
                                registry.observe(announcement);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "invalid announcement");
                            }
                        }
                    }
                }
            }
        });

        // Announcer: periodic self-record on the topic.
        let host = Arc::clone(&self.host);
        let identity = self.identity.clone();
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {
                        let announcement = NodeAnnouncement {
                            peer_id: host.id(),
                            name: identity.name.clone(),
                            labels: identity.labels.clone(),
                            addrs: host.addrs().await,
                            version: identity.version.clone(),
                            timestamp: chrono::Utc::now().timestamp(),
                        };
                        match serde_json::to_vec(&announcement) {
                            Ok(data) => {
                                if let Err(e) = host.publish(data).await {
                                    debug!(error = %e, "announcement not published");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode announcement"),
                        }
                    }
                }
            }
        });

        // Sweeper: evict stale nodes.
        let registry = Arc::clone(&self.registry);
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(NODE_TIMEOUT / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => registry.sweep(),
                }
            }
        });

        info!(topic = DISCOVERY_TOPIC, "discovery service started");
        Ok(())
    }

    /// Stop the background loops.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// The registry this service feeds.
    #[must_use]
    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&self.registry)
    }

    /// Snapshot of currently-known nodes.
    #[must_use]
    pub fn nodes(&self) -> Vec<DiscoveredNode> {
        self.registry.nodes()
    }
}
