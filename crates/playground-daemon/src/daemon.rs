//! Daemon orchestrator: peer host, discovery, protocol handlers, runtime.

use std::path::PathBuf;
use std::sync::Arc;

use futures::io::AsyncReadExt;
use playground_core::identity::VerifyingKey;
use playground_core::runtime::{tail_lines, RuntimeConfig};
use playground_core::{identity, package, Application, Error, Result, Runtime};
use playground_net::discovery::{DiscoveryService, NodeIdentity, NodeRegistry, NODE_TIMEOUT};
use playground_net::host::load_or_generate_identity;
use playground_net::protocol::framing::{read_message, write_message};
use playground_net::protocol::{
    DeployRequest, DeployResponse, ListAppsResponse, LogsRequest, LogsResponse, CHUNK_SIZE,
    DEPLOY_PROTOCOL, LIST_PROTOCOL, LOGS_PROTOCOL,
};
use playground_net::{HostConfig, PeerHost, Stream};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;

/// A running daemon instance.
pub struct Daemon {
    host: Arc<PeerHost>,
    discovery: DiscoveryService,
    runtime: Runtime,
    shutdown: watch::Sender<bool>,
}

struct HandlerState {
    runtime: Runtime,
    trusted: Vec<VerifyingKey>,
    packages_dir: PathBuf,
    apps_dir: PathBuf,
    require_signed: bool,
    shutdown: watch::Receiver<bool>,
}

impl Daemon {
    /// Bring the daemon up: storage roots, keys, peer host, discovery and
    /// the three protocol handlers.
    ///
    /// # Errors
    ///
    /// Fails fatally when a storage root cannot be created, the identity or
    /// trust keys cannot be loaded, or a listener cannot be bound.
    pub async fn start(config: DaemonConfig) -> Result<Self> {
        info!("starting p2p-playground daemon");

        let storage = &config.storage;
        std::fs::create_dir_all(storage.packages_dir())?;
        std::fs::create_dir_all(storage.apps_dir())?;
        std::fs::create_dir_all(storage.trusted_keys_dir())?;

        let trusted = identity::load_trusted_keys(&storage.trusted_keys_dir())?;
        if config.security.require_signed_packages && trusted.is_empty() {
            warn!("signed packages required but the trust set is empty; every deploy will be refused");
        }

        let keypair = load_or_generate_identity(&storage.identity_key_path())?;

        let psk = if config.security.enable_auth {
            if config.security.psk.is_none() {
                warn!("authentication enabled without a PSK; transport gating is off");
            }
            config.security.psk.clone()
        } else {
            None
        };

        let host = PeerHost::new(
            keypair,
            HostConfig {
                listen_addrs: config.node.listen_addrs.clone(),
                psk,
                trusted_peers: config.security.trusted_peers.clone(),
                bootstrap_peers: config.node.bootstrap_peers.clone(),
                enable_mdns: config.node.enable_mdns,
                dht_mode: config.node.dht_mode,
                enable_port_mapping: config.node.enable_port_mapping,
                enable_hole_punching: config.node.enable_hole_punching,
                enable_relay_service: config.node.enable_relay_service,
                enable_auto_relay: config.node.enable_auto_relay,
                static_relays: config.node.static_relays.clone(),
                ..HostConfig::default()
            },
        )
        .await?;

        let registry = Arc::new(NodeRegistry::new(NODE_TIMEOUT));
        let discovery = DiscoveryService::new(
            Arc::clone(&host),
            registry,
            NodeIdentity {
                name: config.node.name.clone(),
                labels: config.node.labels.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );
        discovery.start()?;

        let runtime = Runtime::new(RuntimeConfig {
            stop_grace: config.runtime.stop_grace,
            restart_settle: config.runtime.restart_settle,
        });

        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(HandlerState {
            runtime: runtime.clone(),
            trusted,
            packages_dir: storage.packages_dir(),
            apps_dir: storage.apps_dir(),
            require_signed: config.security.require_signed_packages,
            shutdown: shutdown.subscribe(),
        });

        let deploy_state = Arc::clone(&state);
        host.register_protocol(DEPLOY_PROTOCOL, move |peer, stream| {
            handle_deploy(Arc::clone(&deploy_state), peer, stream)
        })?;

        let list_state = Arc::clone(&state);
        host.register_protocol(LIST_PROTOCOL, move |peer, stream| {
            handle_list(Arc::clone(&list_state), peer, stream)
        })?;

        let logs_state = Arc::clone(&state);
        host.register_protocol(LOGS_PROTOCOL, move |peer, stream| {
            handle_logs(Arc::clone(&logs_state), peer, stream)
        })?;

        info!(
            peer_id = %host.id(),
            addrs = ?host.addrs().await,
            "daemon started"
        );

        Ok(Self {
            host,
            discovery,
            runtime,
            shutdown,
        })
    }

    /// Shut down discovery, the peer host and the follow streams.
    pub async fn stop(&self) {
        info!("stopping daemon");
        let _ = self.shutdown.send(true);
        self.discovery.stop();
        self.host.close().await;
        info!("daemon stopped");
    }

    /// The daemon's peer host.
    #[must_use]
    pub fn host(&self) -> Arc<PeerHost> {
        Arc::clone(&self.host)
    }

    /// The daemon's application runtime.
    #[must_use]
    pub fn runtime(&self) -> Runtime {
        self.runtime.clone()
    }

    /// The daemon's discovery service.
    #[must_use]
    pub const fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }
}

async fn handle_deploy(state: Arc<HandlerState>, peer: String, mut stream: Stream) {
    debug!(peer = %peer, "received deploy request");
    let result = deploy_inner(&state, &mut stream).await;

    let response = match &result {
        Ok(app_id) => DeployResponse {
            success: true,
            app_id: Some(app_id.clone()),
            error: None,
        },
        Err(e) => DeployResponse {
            success: false,
            app_id: None,
            error: Some(e.code().to_string()),
        },
    };
    if let Err(e) = write_message(&mut stream, &response).await {
        warn!(peer = %peer, error = %e, "failed to send deploy response");
        return;
    }

    match result {
        Ok(app_id) => info!(peer = %peer, app_id = %app_id, "deploy response sent"),
        Err(e) => {
            warn!(peer = %peer, error = %e, "deploy failed");
            // Drain whatever body the client is still sending so it can
            // finish its write and read the reply before the stream closes.
            let mut sink = vec![0u8; CHUNK_SIZE];
            let drain = async {
                while let Ok(n) = stream.read(&mut sink).await {
                    if n == 0 {
                        break;
                    }
                }
            };
            let _ = tokio::time::timeout(std::time::Duration::from_secs(10), drain).await;
        }
    }
}

async fn deploy_inner(state: &HandlerState, stream: &mut Stream) -> Result<String> {
    let request: DeployRequest = read_message(stream).await?;
    debug!(
        file_name = %request.file_name,
        file_size = request.file_size,
        auto_start = request.auto_start,
        signed = request.signature.is_some(),
        "deploy request details"
    );

    if request.file_name.is_empty()
        || request.file_name.contains('/')
        || request.file_name.contains("..")
    {
        return Err(Error::InvalidInput(format!(
            "unacceptable file name {:?}",
            request.file_name
        )));
    }
    if request.file_size > package::MAX_PACKAGE_SIZE {
        return Err(Error::InvalidInput(format!(
            "file size {} exceeds maximum {}",
            request.file_size,
            package::MAX_PACKAGE_SIZE
        )));
    }

    // A strict daemon refuses unsigned uploads before reading any body byte.
    if request.signature.is_none() && state.require_signed {
        return Err(Error::PackageNotSigned);
    }

    let archive_path = state.packages_dir.join(&request.file_name);
    let digest = receive_archive(stream, &archive_path, request.file_size).await?;

    if let Some(signature) = &request.signature {
        if !identity::verify_digest_any(&state.trusted, &digest, signature) {
            let _ = std::fs::remove_file(&archive_path);
            return Err(Error::InvalidSignature);
        }
    }

    let manifest = {
        let archive = archive_path.clone();
        tokio::task::spawn_blocking(move || package::manifest_from_archive(&archive))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??
    };
    let app_id = manifest.app_id();
    let app_dir = state.apps_dir.join(&app_id);

    let manifest = {
        let archive = archive_path.clone();
        let dest = app_dir.clone();
        tokio::task::spawn_blocking(move || package::unpack(&archive, &dest))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??
    };

    let auto_restart = manifest.health_check.is_some();
    let app = Application::from_manifest(manifest, app_dir, Some(archive_path));
    state.runtime.register(app)?;

    if request.auto_start {
        if let Err(e) = state.runtime.start(&app_id, auto_restart).await {
            // The package is deployed either way; starting is best-effort.
            warn!(app_id = %app_id, error = %e, "failed to auto-start application");
        } else {
            info!(app_id = %app_id, "application started");
        }
    }

    Ok(app_id)
}

/// Per-chunk deadline while receiving an archive body.
const CHUNK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Stream exactly `expected` body bytes into `dest`, hashing as they pass.
async fn receive_archive(
    stream: &mut Stream,
    dest: &std::path::Path,
    expected: u64,
) -> Result<[u8; 32]> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;

    while received < expected {
        let want = usize::try_from((expected - received).min(buf.len() as u64))
            .unwrap_or(buf.len());
        let n = tokio::time::timeout(CHUNK_TIMEOUT, stream.read(&mut buf[..want]))
            .await
            .map_err(|_| {
                let _ = std::fs::remove_file(dest);
                Error::Timeout("no transfer progress within 30s".into())
            })?
            .map_err(|e| Error::ConnectionFailed(format!("failed to read chunk: {e}")))?;
        if n == 0 {
            let _ = std::fs::remove_file(dest);
            return Err(Error::InvalidPackage(format!(
                "incomplete transfer: received {received} of {expected} bytes"
            )));
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        received += n as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    debug!(path = %dest.display(), size = received, "archive received");
    Ok(hasher.finalize().into())
}

async fn handle_list(state: Arc<HandlerState>, peer: String, mut stream: Stream) {
    debug!(peer = %peer, "received list request");
    let apps = state.runtime.list();
    let count = apps.len();
    let response = ListAppsResponse {
        success: true,
        apps: Some(apps),
        error: None,
    };
    if let Err(e) = write_message(&mut stream, &response).await {
        warn!(peer = %peer, error = %e, "failed to send list response");
    } else {
        debug!(peer = %peer, app_count = count, "list response sent");
    }
}

async fn handle_logs(state: Arc<HandlerState>, peer: String, mut stream: Stream) {
    let request: LogsRequest = match read_message(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            warn!(peer = %peer, error = %e, "failed to read logs request");
            let _ = write_message(&mut stream, &logs_error(&e)).await;
            return;
        }
    };
    debug!(
        peer = %peer,
        app_id = %request.app_id,
        follow = request.follow,
        tail = request.tail,
        "received logs request"
    );

    let content = match state.runtime.logs(&request.app_id).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(peer = %peer, app_id = %request.app_id, error = %e, "logs request failed");
            let _ = write_message(&mut stream, &logs_error(&e)).await;
            return;
        }
    };

    let first = LogsResponse {
        success: true,
        logs: Some(tail_lines(&content, request.tail)),
        error: None,
    };
    if write_message(&mut stream, &first).await.is_err() {
        return;
    }

    if !request.follow {
        return;
    }

    // Follow mode: keep pushing framed chunks until the client goes away
    // or the daemon shuts down.
    let (_cancel, cancel_rx) = watch::channel(false);
    let mut chunks = match state.runtime.follow_logs(&request.app_id, cancel_rx).await {
        Ok(chunks) => chunks,
        Err(e) => {
            debug!(app_id = %request.app_id, error = %e, "follow unavailable");
            return;
        }
    };
    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else { return };
                let response = LogsResponse {
                    success: true,
                    logs: Some(String::from_utf8_lossy(&chunk).into_owned()),
                    error: None,
                };
                if write_message(&mut stream, &response).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn logs_error(error: &Error) -> LogsResponse {
    LogsResponse {
        success: false,
        logs: None,
        error: Some(error.code().to_string()),
    }
}
