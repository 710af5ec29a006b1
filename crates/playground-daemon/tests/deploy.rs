//! End-to-end deploy, list and logs over a loopback peer fabric.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use playground_core::identity::Signer;
use playground_core::{package, AppStatus, Error};
use playground_daemon::config::DaemonConfig;
use playground_daemon::Daemon;
use playground_net::protocol::client;
use playground_net::{DhtMode, HostConfig, Keypair, PeerHost};
use tempfile::TempDir;

fn daemon_config(data_dir: &Path, require_signed: bool) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.node.listen_addrs = vec!["/ip4/127.0.0.1/tcp/0".into()];
    config.node.enable_mdns = false;
    config.node.dht_mode = DhtMode::Off;
    config.node.enable_port_mapping = false;
    config.node.enable_hole_punching = false;
    config.node.enable_relay_service = false;
    config.node.enable_auto_relay = false;
    config.storage.data_dir = data_dir.to_path_buf();
    config.security.require_signed_packages = require_signed;
    config.runtime.stop_grace = Duration::from_millis(500);
    config
}

fn install_trusted_key(data_dir: &Path, signer: &Signer) {
    let trusted = data_dir.join("keys").join("trusted");
    fs::create_dir_all(&trusted).unwrap();
    fs::write(trusted.join("controller.pub"), signer.public_key_bytes()).unwrap();
}

fn make_package(root: &Path) -> PathBuf {
    let app = root.join("hello-world");
    fs::create_dir_all(app.join("bin")).unwrap();
    fs::write(
        app.join("manifest.yaml"),
        "name: hello-world\nversion: 1.0.0\nentrypoint: bin/hello-world\n",
    )
    .unwrap();
    let binary = app.join("bin/hello-world");
    fs::write(
        &binary,
        "#!/bin/sh\necho hello from playground\nexec sleep 30\n",
    )
    .unwrap();
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
    package::pack(&app).unwrap()
}

async fn client_host() -> Arc<PeerHost> {
    PeerHost::new(
        Keypair::generate_ed25519(),
        HostConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".into()],
            enable_mdns: false,
            dht_mode: DhtMode::Off,
            enable_port_mapping: false,
            enable_hole_punching: false,
            enable_relay_service: false,
            enable_auto_relay: false,
            ..HostConfig::default()
        },
    )
    .await
    .unwrap()
}

async fn daemon_addr(daemon: &Daemon) -> String {
    let host = daemon.host();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let addrs = host.addrs().await;
        if let Some(addr) = addrs.first() {
            return format!("{addr}/p2p/{}", host.id());
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "daemon never started listening"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn signed_deploy_runs_and_serves_logs() {
    let data = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let signer = Signer::generate();
    install_trusted_key(data.path(), &signer);

    let daemon = Daemon::start(daemon_config(data.path(), true)).await.unwrap();
    let archive = make_package(workspace.path());
    let signature = signer.sign_file(&archive).unwrap();

    let client = client_host().await;
    client.connect(&daemon_addr(&daemon).await).await.unwrap();

    let app_id = client::deploy(
        &client,
        &daemon.host().id(),
        &archive,
        true,
        Some(signature),
        None,
    )
    .await
    .unwrap();
    assert_eq!(app_id, "hello-world-1.0.0");

    // The archive landed under packages/ and the tree under apps/.
    assert!(data
        .path()
        .join("packages")
        .join("hello-world-1.0.0.tar.gz")
        .exists());
    assert!(data
        .path()
        .join("apps")
        .join("hello-world-1.0.0")
        .join("manifest.yaml")
        .exists());

    let apps = client::list_apps(&client, &daemon.host().id()).await.unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].id, "hello-world-1.0.0");
    assert_eq!(apps[0].status, AppStatus::Running);
    assert!(apps[0].pid > 0);

    // The greeting shows up in the captured logs.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let logs = client::fetch_logs(&client, &daemon.host().id(), &app_id, 0)
            .await
            .unwrap();
        if logs.contains("hello from playground") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "log line never appeared"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Tail larger than the line count returns everything.
    let tailed = client::fetch_logs(&client, &daemon.host().id(), &app_id, 100)
        .await
        .unwrap();
    assert!(tailed.contains("hello from playground"));

    daemon.runtime().stop(&app_id).await.unwrap();
    client.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn unsigned_deploy_refused_by_strict_daemon() {
    let data = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let signer = Signer::generate();
    install_trusted_key(data.path(), &signer);

    let daemon = Daemon::start(daemon_config(data.path(), true)).await.unwrap();
    let archive = make_package(workspace.path());

    let client = client_host().await;
    client.connect(&daemon_addr(&daemon).await).await.unwrap();

    let result = client::deploy(&client, &daemon.host().id(), &archive, true, None, None).await;
    match result {
        Err(Error::Remote(code)) => assert_eq!(code, "PackageNotSigned"),
        other => panic!("unexpected result: {other:?}"),
    }

    // Nothing was unpacked.
    let apps_dir = data.path().join("apps");
    assert!(fs::read_dir(&apps_dir).unwrap().next().is_none());
    assert!(client::list_apps(&client, &daemon.host().id())
        .await
        .unwrap()
        .is_empty());

    client.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn tampered_archive_is_rejected() {
    let data = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let signer = Signer::generate();
    install_trusted_key(data.path(), &signer);

    let daemon = Daemon::start(daemon_config(data.path(), true)).await.unwrap();
    let archive = make_package(workspace.path());
    let signature = signer.sign_file(&archive).unwrap();

    // Flip one byte after signing.
    let mut bytes = fs::read(&archive).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&archive, bytes).unwrap();

    let client = client_host().await;
    client.connect(&daemon_addr(&daemon).await).await.unwrap();

    let result = client::deploy(
        &client,
        &daemon.host().id(),
        &archive,
        true,
        Some(signature),
        None,
    )
    .await;
    match result {
        Err(Error::Remote(code)) => assert_eq!(code, "InvalidSignature"),
        other => panic!("unexpected result: {other:?}"),
    }

    let apps_dir = data.path().join("apps");
    assert!(fs::read_dir(&apps_dir).unwrap().next().is_none());
    // The rejected archive was removed from packages/ as well.
    assert!(fs::read_dir(data.path().join("packages"))
        .unwrap()
        .next()
        .is_none());

    client.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn follow_mode_streams_new_log_lines() {
    let data = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let daemon = Daemon::start(daemon_config(data.path(), false)).await.unwrap();

    // An app that keeps producing output.
    let app = workspace.path().join("ticker");
    fs::create_dir_all(app.join("bin")).unwrap();
    fs::write(
        app.join("manifest.yaml"),
        "name: ticker\nversion: 1.0.0\nentrypoint: bin/run.sh\n",
    )
    .unwrap();
    let script = app.join("bin/run.sh");
    fs::write(
        &script,
        "#!/bin/sh\nwhile true; do echo tick; sleep 0.2; done\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    let archive = package::pack(&app).unwrap();

    let client = client_host().await;
    client.connect(&daemon_addr(&daemon).await).await.unwrap();
    let app_id = client::deploy(&client, &daemon.host().id(), &archive, true, None, None)
        .await
        .unwrap();

    let (chunks_tx, mut chunks_rx) = tokio::sync::mpsc::unbounded_channel();
    let host_id = daemon.host().id();
    let follow = client::follow_logs(&client, &host_id, &app_id, 0, move |chunk| {
        let _ = chunks_tx.send(chunk.to_string());
    });
    tokio::pin!(follow);

    // Successive framed chunks keep arriving while the app runs.
    let mut ticks = 0usize;
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    while ticks < 3 {
        tokio::select! {
            result = &mut follow => panic!("follow ended early: {result:?}"),
            _ = &mut deadline => panic!("no streamed log lines arrived"),
            chunk = chunks_rx.recv() => {
                let chunk = chunk.unwrap();
                ticks += chunk.matches("tick").count();
            }
        }
    }

    daemon.runtime().stop(&app_id).await.unwrap();
    client.close().await;
    daemon.stop().await;
}

#[tokio::test]
async fn fan_out_deploys_to_several_daemons() {
    let data_a = TempDir::new().unwrap();
    let data_b = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let daemon_a = Daemon::start(daemon_config(data_a.path(), false)).await.unwrap();
    let daemon_b = Daemon::start(daemon_config(data_b.path(), false)).await.unwrap();
    let archive = make_package(workspace.path());

    let client = client_host().await;
    client.connect(&daemon_addr(&daemon_a).await).await.unwrap();
    client.connect(&daemon_addr(&daemon_b).await).await.unwrap();

    let host_id_a = daemon_a.host().id();
    let host_id_b = daemon_b.host().id();
    let (result_a, result_b) = tokio::join!(
        client::deploy(&client, &host_id_a, &archive, true, None, None),
        client::deploy(&client, &host_id_b, &archive, true, None, None),
    );
    let app_a = result_a.unwrap();
    let app_b = result_b.unwrap();
    assert_eq!(app_a, "hello-world-1.0.0");
    assert_eq!(app_b, "hello-world-1.0.0");

    for daemon in [&daemon_a, &daemon_b] {
        let apps = client::list_apps(&client, &daemon.host().id()).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].status, AppStatus::Running);
        daemon.runtime().stop(&app_a).await.unwrap();
    }

    client.close().await;
    daemon_a.stop().await;
    daemon_b.stop().await;
}

#[tokio::test]
async fn unknown_app_logs_report_not_found() {
    let data = TempDir::new().unwrap();

    let daemon = Daemon::start(daemon_config(data.path(), false)).await.unwrap();
    let client = client_host().await;
    client.connect(&daemon_addr(&daemon).await).await.unwrap();

    let result = client::fetch_logs(&client, &daemon.host().id(), "ghost-1.0.0", 0).await;
    match result {
        Err(Error::Remote(code)) => assert_eq!(code, "NotFound"),
        other => panic!("unexpected result: {other:?}"),
    }

    client.close().await;
    daemon.stop().await;
}
