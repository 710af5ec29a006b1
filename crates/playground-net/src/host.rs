//! Secured libp2p peer host.
//!
//! The host owns the swarm in a background task. Connections are upgraded
//! with TLS 1.3 or Noise (peer's choice); when a pre-shared key is
//! configured the TCP transport is wrapped in the private-network handshake
//! first, so peers with a different PSK fail before any protocol is spoken.
//! A non-empty trusted-peer list installs an allow-list gate that rejects
//! dials to, and secured connections from, unknown peers.
//!
//! Raw per-protocol streams come from `libp2p-stream`, which gives the
//! go-libp2p-style `open_stream` / handler registration surface the transfer
//! protocols are written against.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use libp2p::core::transport::upgrade::Version;
use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::multiaddr::Protocol;
use libp2p::pnet::{PnetConfig, PreSharedKey};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{
    allow_block_list, autonat, dcutr, gossipsub, identify, kad, mdns, noise, relay, tcp, tls,
    upnp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder, Transport,
};
use libp2p_stream::{Control, OpenStreamError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use playground_core::{identity as keys, Error, Result as CoreResult};

use crate::discovery::DISCOVERY_TOPIC;

/// Identify protocol advertised by every node.
const IDENTIFY_PROTOCOL: &str = "/p2p-playground/id/1.0.0";

/// Provider-search cadence for the routing layer.
const PROVIDER_QUERY_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on relays adopted from the routing table.
const MAX_AUTO_RELAYS: usize = 2;

/// Default bootstrap nodes used when the routing layer is enabled and no
/// bootstrap peers are configured.
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// Routing-layer participation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DhtMode {
    /// Routing disabled.
    Off,
    /// Query-only participant.
    Client,
    /// Full routing participant.
    #[default]
    Server,
}

/// Peer host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Multiaddrs to listen on.
    pub listen_addrs: Vec<String>,

    /// Hex-encoded pre-shared key gating the private network.
    pub psk: Option<String>,

    /// Peer ids allowed to connect; empty means everyone.
    pub trusted_peers: Vec<String>,

    /// Initial peers to dial.
    pub bootstrap_peers: Vec<String>,

    /// Local multicast discovery.
    pub enable_mdns: bool,

    /// Routing-layer mode.
    pub dht_mode: DhtMode,

    /// OS-level port mapping (UPnP).
    pub enable_port_mapping: bool,

    /// Hole-punching coordination (DCUtR plus AutoNAT probing).
    pub enable_hole_punching: bool,

    /// Act as a relay for other peers.
    pub enable_relay_service: bool,

    /// Consume relays for inbound reachability.
    pub enable_auto_relay: bool,

    /// User-supplied relay addresses, honored even without routing.
    pub static_relays: Vec<String>,

    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/0".into()],
            psk: None,
            trusted_peers: Vec::new(),
            bootstrap_peers: Vec::new(),
            enable_mdns: true,
            dht_mode: DhtMode::Server,
            enable_port_mapping: true,
            enable_hole_punching: true,
            enable_relay_service: true,
            enable_auto_relay: true,
            static_relays: Vec::new(),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// A connected peer and its remote addresses.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer id.
    pub id: String,

    /// Remote addresses of the live connections.
    pub addrs: Vec<String>,
}

/// A gossip payload received on the discovery topic.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// Signing peer, when the message was signed.
    pub source: Option<String>,

    /// Raw payload.
    pub data: Vec<u8>,
}

#[derive(NetworkBehaviour)]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    streams: libp2p_stream::Behaviour,
    kademlia: Toggle<kad::Behaviour<MemoryStore>>,
    mdns: Toggle<mdns::tokio::Behaviour>,
    relay: Toggle<relay::Behaviour>,
    relay_client: Toggle<relay::client::Behaviour>,
    dcutr: Toggle<dcutr::Behaviour>,
    autonat: Toggle<autonat::Behaviour>,
    upnp: Toggle<upnp::tokio::Behaviour>,
    allowed_peers: Toggle<allow_block_list::Behaviour<allow_block_list::AllowedPeers>>,
}

enum Command {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Publish {
        data: Vec<u8>,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<String>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Shutdown,
}

/// Handle onto the local node's swarm.
pub struct PeerHost {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    control: Control,
    gossip_rx: Mutex<Option<mpsc::Receiver<GossipMessage>>>,
    closed: watch::Sender<bool>,
}

impl PeerHost {
    /// Bring up the host: build the transport and behaviours, start
    /// listening and spawn the swarm task.
    ///
    /// # Errors
    ///
    /// Fails on malformed configuration (addresses, PSK, trusted peer ids)
    /// and on listener bind failures.
    pub async fn new(keypair: Keypair, config: HostConfig) -> CoreResult<Arc<Self>> {
        let local_peer_id = PeerId::from(keypair.public());

        let trusted: Vec<PeerId> = config
            .trusted_peers
            .iter()
            .map(|id| {
                id.parse()
                    .map_err(|_| Error::InvalidInput(format!("invalid trusted peer id {id}")))
            })
            .collect::<CoreResult<_>>()?;

        let mut swarm = build_swarm(&keypair, &config, &trusted)?;

        for addr in &config.listen_addrs {
            let addr: Multiaddr = addr
                .parse()
                .map_err(|e| Error::InvalidInput(format!("invalid multiaddr {addr}: {e}")))?;
            swarm
                .listen_on(addr)
                .map_err(|e| Error::ConnectionFailed(format!("failed to bind listener: {e}")))?;
        }

        setup_relays(&mut swarm, &config);
        setup_routing(&mut swarm, &config);

        info!(
            id = %local_peer_id,
            psk = config.psk.is_some(),
            trusted_peers = trusted.len(),
            dht = ?config.dht_mode,
            "peer host created"
        );

        let control = swarm.behaviour().streams.new_control();
        let (commands, command_rx) = mpsc::channel(64);
        let (gossip_tx, gossip_rx) = mpsc::channel(64);
        let (closed, _) = watch::channel(false);

        let auto_relay_from_routing = config.enable_auto_relay
            && config.static_relays.is_empty()
            && config.dht_mode != DhtMode::Off;
        let dht_enabled = config.dht_mode != DhtMode::Off;
        tokio::spawn(run_swarm(
            swarm,
            command_rx,
            gossip_tx,
            RunState {
                local_peer_id,
                dht_enabled,
                auto_relay_from_routing,
                connected: HashMap::new(),
                pending_dials: HashMap::new(),
                relays_in_use: 0,
            },
        ));

        Ok(Arc::new(Self {
            local_peer_id,
            commands,
            control,
            gossip_rx: Mutex::new(Some(gossip_rx)),
            closed,
        }))
    }

    /// Stable peer id string of this host.
    #[must_use]
    pub fn id(&self) -> String {
        self.local_peer_id.to_string()
    }

    /// Typed peer id of this host.
    #[must_use]
    pub const fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Current listen addresses.
    pub async fn addrs(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::ListenAddrs { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Currently connected peers with their remote addresses.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Peers { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Dial a peer by full multiaddr (must end in `/p2p/<peer id>`).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] for malformed addresses,
    /// [`Error::ConnectionFailed`] for unreachable peers, and
    /// [`Error::Timeout`] when the dial does not settle within 30s.
    pub async fn connect(&self, addr: &str) -> CoreResult<()> {
        let addr: Multiaddr = addr
            .parse()
            .map_err(|e| Error::InvalidInput(format!("invalid multiaddr {addr}: {e}")))?;

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dial { addr, reply })
            .await
            .map_err(|_| Error::ConnectionFailed("host is closed".into()))?;

        match tokio::time::timeout(Duration::from_secs(30), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionFailed("host is closed".into())),
            Err(_) => Err(Error::Timeout("dial did not settle within 30s".into())),
        }
    }

    /// Open a bidirectional stream to a connected peer for one protocol.
    ///
    /// # Errors
    ///
    /// [`Error::ProtocolNotSupported`] when the remote does not speak the
    /// protocol, [`Error::ConnectionFailed`] otherwise.
    pub async fn open_stream(&self, peer_id: &str, protocol: &'static str) -> CoreResult<libp2p::Stream> {
        let peer: PeerId = peer_id
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid peer id {peer_id}")))?;

        let mut control = self.control.clone();
        match control.open_stream(peer, StreamProtocol::new(protocol)).await {
            Ok(stream) => Ok(stream),
            Err(OpenStreamError::UnsupportedProtocol(_)) => {
                Err(Error::ProtocolNotSupported(protocol.to_string()))
            }
            Err(e) => Err(Error::ConnectionFailed(format!(
                "unreachable peer {peer_id}: {e}"
            ))),
        }
    }

    /// Register a handler invoked once per inbound stream of a protocol.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] when the protocol already has a handler.
    pub fn register_protocol<F, Fut>(&self, protocol: &'static str, handler: F) -> CoreResult<()>
    where
        F: Fn(String, libp2p::Stream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut control = self.control.clone();
        let mut incoming = control
            .accept(StreamProtocol::new(protocol))
            .map_err(|_| Error::AlreadyExists(format!("protocol {protocol}")))?;

        tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                debug!(peer = %peer, protocol, "inbound stream");
                tokio::spawn(handler(peer.to_string(), stream));
            }
        });
        Ok(())
    }

    /// Publish a payload on the discovery gossip topic.
    ///
    /// # Errors
    ///
    /// Fails when the host is closed or gossip has no peers yet.
    pub async fn publish(&self, data: Vec<u8>) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish { data, reply })
            .await
            .map_err(|_| Error::ConnectionFailed("host is closed".into()))?;
        rx.await
            .map_err(|_| Error::ConnectionFailed("host is closed".into()))?
    }

    /// Claim the inbound gossip message receiver (single consumer).
    ///
    /// # Errors
    ///
    /// Fails when the receiver was already taken.
    pub fn take_gossip_messages(&self) -> CoreResult<mpsc::Receiver<GossipMessage>> {
        self.gossip_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Internal("gossip receiver already taken".into()))
    }

    /// Shut the host down. Idempotent.
    pub async fn close(&self) {
        let _ = self.closed.send(true);
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

struct RunState {
    local_peer_id: PeerId,
    dht_enabled: bool,
    auto_relay_from_routing: bool,
    connected: HashMap<PeerId, Vec<Multiaddr>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<CoreResult<()>>>>,
    relays_in_use: usize,
}

fn build_swarm(
    keypair: &Keypair,
    config: &HostConfig,
    trusted: &[PeerId],
) -> CoreResult<Swarm<Behaviour>> {
    let psk = config
        .psk
        .as_deref()
        .map(keys::decode_psk)
        .transpose()?
        .map(PreSharedKey::new);

    let swarm = match psk {
        None => SwarmBuilder::with_existing_identity(keypair.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                (tls::Config::new, noise::Config::new),
                yamux::Config::default,
            )
            .map_err(|e| Error::Internal(format!("transport setup failed: {e}")))?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(|e| Error::Internal(format!("relay client setup failed: {e}")))?
            .with_behaviour(|key, relay_client| {
                build_behaviour(key, Some(relay_client), config, trusted)
            })
            .map_err(|e| Error::Internal(format!("behaviour setup failed: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_timeout))
            .build(),
        Some(psk) => SwarmBuilder::with_existing_identity(keypair.clone())
            .with_tokio()
            .with_other_transport(|key| {
                let noise_config = noise::Config::new(key)?;
                let base = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
                Ok(base
                    .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
                    .upgrade(Version::V1Lazy)
                    .authenticate(noise_config)
                    .multiplex(yamux::Config::default()))
            })
            .map_err(|e| Error::Internal(format!("transport setup failed: {e}")))?
            .with_behaviour(|key| build_behaviour(key, None, config, trusted))
            .map_err(|e| Error::Internal(format!("behaviour setup failed: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_timeout))
            .build(),
    };

    Ok(swarm)
}

fn build_behaviour(
    key: &Keypair,
    relay_client: Option<relay::client::Behaviour>,
    config: &HostConfig,
    trusted: &[PeerId],
) -> std::result::Result<Behaviour, Box<dyn std::error::Error + Send + Sync>> {
    let local_peer_id = PeerId::from(key.public());

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .validation_mode(gossipsub::ValidationMode::Strict)
        .build()
        .map_err(std::io::Error::other)?;
    let mut gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(key.clone()),
        gossipsub_config,
    )
    .map_err(std::io::Error::other)?;
    gossipsub
        .subscribe(&gossipsub::IdentTopic::new(DISCOVERY_TOPIC))
        .map_err(std::io::Error::other)?;

    let kademlia = match config.dht_mode {
        DhtMode::Off => None,
        mode => {
            let mut kademlia =
                kad::Behaviour::new(local_peer_id, MemoryStore::new(local_peer_id));
            kademlia.set_mode(Some(match mode {
                DhtMode::Client => kad::Mode::Client,
                _ => kad::Mode::Server,
            }));
            Some(kademlia)
        }
    };

    let mdns = if config.enable_mdns {
        Some(mdns::tokio::Behaviour::new(
            mdns::Config::default(),
            local_peer_id,
        )?)
    } else {
        None
    };

    let allowed_peers = if trusted.is_empty() {
        None
    } else {
        let mut allowed = allow_block_list::Behaviour::<allow_block_list::AllowedPeers>::default();
        for peer in trusted {
            allowed.allow_peer(*peer);
        }
        Some(allowed)
    };

    Ok(Behaviour {
        gossipsub,
        identify: identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            key.public(),
        )),
        streams: libp2p_stream::Behaviour::new(),
        kademlia: Toggle::from(kademlia),
        mdns: Toggle::from(mdns),
        relay: Toggle::from(
            config
                .enable_relay_service
                .then(|| relay::Behaviour::new(local_peer_id, relay::Config::default())),
        ),
        relay_client: Toggle::from(relay_client),
        dcutr: Toggle::from(
            config
                .enable_hole_punching
                .then(|| dcutr::Behaviour::new(local_peer_id)),
        ),
        autonat: Toggle::from(
            config
                .enable_hole_punching
                .then(|| autonat::Behaviour::new(local_peer_id, autonat::Config::default())),
        ),
        upnp: Toggle::from(config.enable_port_mapping.then(upnp::tokio::Behaviour::default)),
        allowed_peers: Toggle::from(allowed_peers),
    })
}

fn setup_relays(swarm: &mut Swarm<Behaviour>, config: &HostConfig) {
    if !config.enable_auto_relay {
        return;
    }
    if config.static_relays.is_empty() {
        if config.dht_mode == DhtMode::Off {
            warn!("auto relay disabled: requires routing or static relays");
        }
        return;
    }
    for addr in &config.static_relays {
        match addr.parse::<Multiaddr>() {
            Ok(relay_addr) => {
                let circuit = relay_addr.with(Protocol::P2pCircuit);
                match swarm.listen_on(circuit.clone()) {
                    Ok(_) => info!(relay = %circuit, "listening via static relay"),
                    Err(e) => warn!(relay = %circuit, error = %e, "static relay unusable"),
                }
            }
            Err(e) => warn!(addr = %addr, error = %e, "invalid static relay address"),
        }
    }
}

fn setup_routing(swarm: &mut Swarm<Behaviour>, config: &HostConfig) {
    let dht_enabled = config.dht_mode != DhtMode::Off;

    let bootstrap: Vec<String> = if config.bootstrap_peers.is_empty() && dht_enabled {
        info!("no bootstrap peers configured, using default bootstrap nodes");
        DEFAULT_BOOTSTRAP_PEERS.iter().map(|s| (*s).to_string()).collect()
    } else {
        config.bootstrap_peers.clone()
    };

    for addr in &bootstrap {
        let Ok(maddr) = addr.parse::<Multiaddr>() else {
            warn!(addr = %addr, "invalid bootstrap peer address");
            continue;
        };
        let peer_id = maddr.iter().find_map(|p| match p {
            Protocol::P2p(peer) => Some(peer),
            _ => None,
        });
        if let (Some(peer), Some(kademlia)) = (peer_id, swarm.behaviour_mut().kademlia.as_mut()) {
            kademlia.add_address(&peer, maddr.clone());
        }
        if let Err(e) = swarm.dial(maddr.clone()) {
            debug!(addr = %addr, error = %e, "bootstrap dial failed");
        }
    }

    if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
        if let Err(e) = kademlia.bootstrap() {
            debug!(error = %e, "routing bootstrap deferred");
        }
        let key = kad::RecordKey::new(&DISCOVERY_TOPIC.as_bytes().to_vec());
        match kademlia.start_providing(key) {
            Ok(_) => info!(topic = DISCOVERY_TOPIC, "advertising topic via routing layer"),
            Err(e) => warn!(error = %e, "failed to advertise topic"),
        }
    }
}

async fn run_swarm(
    mut swarm: Swarm<Behaviour>,
    mut commands: mpsc::Receiver<Command>,
    gossip_tx: mpsc::Sender<GossipMessage>,
    mut state: RunState,
) {
    let topic = gossipsub::IdentTopic::new(DISCOVERY_TOPIC);
    let provider_key = kad::RecordKey::new(&DISCOVERY_TOPIC.as_bytes().to_vec());
    let mut provider_timer = tokio::time::interval(PROVIDER_QUERY_INTERVAL);
    provider_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(Command::Shutdown) => {
                    info!("peer host shutting down");
                    return;
                }
                Some(Command::Dial { addr, reply }) => handle_dial(&mut swarm, &mut state, addr, reply),
                Some(Command::Publish { data, reply }) => {
                    let result = swarm
                        .behaviour_mut()
                        .gossipsub
                        .publish(topic.clone(), data)
                        .map(|_| ())
                        .map_err(|e| Error::ConnectionFailed(format!("gossip publish failed: {e}")));
                    let _ = reply.send(result);
                }
                Some(Command::ListenAddrs { reply }) => {
                    let addrs = swarm.listeners().map(ToString::to_string).collect();
                    let _ = reply.send(addrs);
                }
                Some(Command::Peers { reply }) => {
                    let peers = state
                        .connected
                        .iter()
                        .map(|(id, addrs)| PeerInfo {
                            id: id.to_string(),
                            addrs: addrs.iter().map(ToString::to_string).collect(),
                        })
                        .collect();
                    let _ = reply.send(peers);
                }
            },
            _ = provider_timer.tick(), if state.dht_enabled => {
                if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                    kademlia.get_providers(provider_key.clone());
                }
            }
            event = swarm.select_next_some() => handle_swarm_event(&mut swarm, &mut state, &gossip_tx, event),
        }
    }
}

fn handle_dial(
    swarm: &mut Swarm<Behaviour>,
    state: &mut RunState,
    addr: Multiaddr,
    reply: oneshot::Sender<CoreResult<()>>,
) {
    let peer_id = addr.iter().find_map(|p| match p {
        Protocol::P2p(peer) => Some(peer),
        _ => None,
    });
    let Some(peer_id) = peer_id else {
        let _ = reply.send(Err(Error::InvalidInput(format!(
            "multiaddr {addr} carries no /p2p peer id"
        ))));
        return;
    };

    if state.connected.contains_key(&peer_id) {
        let _ = reply.send(Ok(()));
        return;
    }

    match swarm.dial(addr) {
        Ok(()) => {
            state.pending_dials.entry(peer_id).or_default().push(reply);
        }
        Err(e) => {
            let _ = reply.send(Err(Error::ConnectionFailed(format!(
                "unreachable peer {peer_id}: {e}"
            ))));
        }
    }
}

fn handle_swarm_event(
    swarm: &mut Swarm<Behaviour>,
    state: &mut RunState,
    gossip_tx: &mpsc::Sender<GossipMessage>,
    event: SwarmEvent<BehaviourEvent>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(addr = %address, "listening");
        }
        SwarmEvent::ConnectionEstablished {
            peer_id, endpoint, ..
        } => {
            debug!(peer = %peer_id, "peer connected");
            state
                .connected
                .entry(peer_id)
                .or_default()
                .push(endpoint.get_remote_address().clone());
            if let Some(waiters) = state.pending_dials.remove(&peer_id) {
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            ..
        } => {
            if num_established == 0 {
                debug!(peer = %peer_id, "peer disconnected");
                state.connected.remove(&peer_id);
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            if let Some(peer_id) = peer_id {
                if let Some(waiters) = state.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(Error::ConnectionFailed(format!(
                            "unreachable peer {peer_id}: {error}"
                        ))));
                    }
                }
                debug!(peer = %peer_id, error = %error, "outgoing connection failed");
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message,
            ..
        })) => {
            if message.source != Some(state.local_peer_id) {
                let gossip = GossipMessage {
                    source: message.source.map(|p| p.to_string()),
                    data: message.data,
                };
                if gossip_tx.try_send(gossip).is_err() {
                    debug!("gossip receiver lagging, dropping message");
                }
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
            for (peer_id, addr) in peers {
                if state.connected.contains_key(&peer_id) {
                    continue;
                }
                info!(peer = %peer_id, addr = %addr, "discovered peer via mDNS");
                if let Err(e) = swarm.dial(addr) {
                    debug!(peer = %peer_id, error = %e, "mDNS dial failed");
                }
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Kademlia(
            kad::Event::OutboundQueryProgressed {
                result:
                    kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                        providers,
                        ..
                    })),
                ..
            },
        )) => {
            for provider in providers {
                if provider == state.local_peer_id || state.connected.contains_key(&provider) {
                    continue;
                }
                info!(peer = %provider, "found provider via routing layer");
                if let Err(e) = swarm.dial(DialOpts::peer_id(provider).build()) {
                    debug!(peer = %provider, error = %e, "provider dial failed");
                }
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                for addr in &info.listen_addrs {
                    kademlia.add_address(&peer_id, addr.clone());
                }
            }
            maybe_adopt_relay(swarm, state, peer_id, &info);
        }
        SwarmEvent::Behaviour(BehaviourEvent::Upnp(event)) => match event {
            upnp::Event::NewExternalAddr(addr) => info!(addr = %addr, "external address mapped"),
            upnp::Event::GatewayNotFound => debug!("no UPnP gateway found"),
            other => debug!(event = ?other, "UPnP event"),
        },
        SwarmEvent::Behaviour(BehaviourEvent::Dcutr(event)) => {
            debug!(event = ?event, "hole punching event");
        }
        SwarmEvent::Behaviour(BehaviourEvent::RelayClient(event)) => {
            debug!(event = ?event, "relay client event");
        }
        other => {
            debug!(event = ?other, "swarm event");
        }
    }
}

/// Adopt a routing-table peer as a relay when auto-relay runs without
/// static relays.
fn maybe_adopt_relay(
    swarm: &mut Swarm<Behaviour>,
    state: &mut RunState,
    peer_id: PeerId,
    info: &identify::Info,
) {
    if !state.auto_relay_from_routing || state.relays_in_use >= MAX_AUTO_RELAYS {
        return;
    }
    if !info
        .protocols
        .iter()
        .any(|p| *p == relay::HOP_PROTOCOL_NAME)
    {
        return;
    }
    let Some(addr) = info.listen_addrs.first() else {
        return;
    };
    let Ok(relay_addr) = addr.clone().with_p2p(peer_id) else {
        return;
    };
    let circuit = relay_addr.with(Protocol::P2pCircuit);
    match swarm.listen_on(circuit.clone()) {
        Ok(_) => {
            state.relays_in_use += 1;
            info!(relay = %circuit, "listening via discovered relay");
        }
        Err(e) => debug!(relay = %circuit, error = %e, "relay listen failed"),
    }
}

/// Load the node identity key, generating and persisting one on first use.
///
/// The file holds the raw 32-byte Ed25519 secret, mode 0600.
///
/// # Errors
///
/// Fails on I/O errors or a key file of the wrong size.
pub fn load_or_generate_identity(path: &Path) -> CoreResult<Keypair> {
    if path.exists() {
        let bytes = fs::read(path)?;
        if bytes.len() != 32 {
            return Err(Error::InvalidInput(format!(
                "invalid key size: {}",
                path.display()
            )));
        }
        return Keypair::ed25519_from_bytes(bytes)
            .map_err(|_| Error::InvalidInput(format!("invalid key size: {}", path.display())));
    }

    let keypair = Keypair::generate_ed25519();
    let ed25519 = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|e| Error::Internal(format!("generated key is not ed25519: {e}")))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(ed25519.secret().as_ref())?;
    file.sync_all()?;

    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use futures::io::{AsyncReadExt, AsyncWriteExt};
    use tempfile::TempDir;

    use super::*;

    const ECHO_PROTOCOL: &str = "/p2p-playground/echo/1.0.0";

    fn loopback_config() -> HostConfig {
        HostConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".into()],
            enable_mdns: false,
            dht_mode: DhtMode::Off,
            enable_port_mapping: false,
            enable_hole_punching: false,
            enable_relay_service: false,
            enable_auto_relay: false,
            ..HostConfig::default()
        }
    }

    async fn wait_for_addr(host: &PeerHost) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let addrs = host.addrs().await;
            if let Some(addr) = addrs.first() {
                return addr.clone();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no listen address appeared"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn host_reports_identity_and_addrs() {
        let host = PeerHost::new(Keypair::generate_ed25519(), loopback_config())
            .await
            .unwrap();
        assert!(host.id().parse::<PeerId>().is_ok());
        let addr = wait_for_addr(&host).await;
        assert!(addr.starts_with("/ip4/127.0.0.1/tcp/"));
        host.close().await;
    }

    #[tokio::test]
    async fn streams_carry_bytes_between_hosts() {
        let server = PeerHost::new(Keypair::generate_ed25519(), loopback_config())
            .await
            .unwrap();
        server
            .register_protocol(ECHO_PROTOCOL, |_peer, mut stream| async move {
                let mut buf = [0u8; 5];
                if stream.read_exact(&mut buf).await.is_ok() {
                    let _ = stream.write_all(&buf).await;
                    let _ = stream.flush().await;
                }
            })
            .unwrap();

        let client = PeerHost::new(Keypair::generate_ed25519(), loopback_config())
            .await
            .unwrap();

        let addr = format!("{}/p2p/{}", wait_for_addr(&server).await, server.id());
        client.connect(&addr).await.unwrap();

        let mut stream = client.open_stream(&server.id(), ECHO_PROTOCOL).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        let peers = client.peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, server.id());

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn psk_mismatch_refuses_connection() {
        let mut server_config = loopback_config();
        server_config.psk = Some(keys::encode_psk(&keys::generate_psk()));
        let server = PeerHost::new(Keypair::generate_ed25519(), server_config)
            .await
            .unwrap();

        let mut client_config = loopback_config();
        client_config.psk = Some(keys::encode_psk(&keys::generate_psk()));
        let client = PeerHost::new(Keypair::generate_ed25519(), client_config)
            .await
            .unwrap();

        let addr = format!("{}/p2p/{}", wait_for_addr(&server).await, server.id());
        assert!(client.connect(&addr).await.is_err());

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let host = PeerHost::new(Keypair::generate_ed25519(), loopback_config())
            .await
            .unwrap();
        host.close().await;
        host.close().await;
        assert!(host.addrs().await.is_empty());
    }

    #[test]
    fn identity_key_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys/identity.key");

        let first = load_or_generate_identity(&path).unwrap();
        let second = load_or_generate_identity(&path).unwrap();
        assert_eq!(
            PeerId::from(first.public()),
            PeerId::from(second.public())
        );

        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(matches!(
            load_or_generate_identity(&path),
            Err(Error::InvalidInput(_))
        ));
    }
}
