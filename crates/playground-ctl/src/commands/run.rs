//! `run` — pack, sign, deploy and tail an application in one go.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use playground_core::identity::{self, Signer};
use playground_core::package;
use playground_net::protocol::client;
use tokio::task::JoinSet;
use tracing::warn;

use crate::context::{short_peer_id, ControllerContext};

pub struct RunArgs {
    pub dir: PathBuf,
    pub node: Option<String>,
    pub private_key: Option<PathBuf>,
    pub cleanup: bool,
    pub no_sign: bool,
}

pub async fn run(ctx: &ControllerContext, args: RunArgs) -> Result<()> {
    if !args.dir.join("manifest.yaml").exists() {
        bail!("manifest.yaml not found in {}", args.dir.display());
    }

    println!("Building and running application from: {}", args.dir.display());
    println!("Controller ID: {}", ctx.host.id());

    println!("\nDiscovering nodes...");
    let targets = ctx.resolve_targets(args.node.clone()).await?;
    println!("Deploying to {} node(s)", targets.len());

    println!("\nBuilding application package...");
    let archive = package::pack(&args.dir).context("failed to build package")?;
    println!("Package created: {}", archive.display());

    let signature = if args.no_sign {
        None
    } else if let Some(key_path) = &args.private_key {
        println!("\nSigning package...");
        let signer = Signer::load(key_path).context("failed to load private key")?;
        let signature = signer.sign_file(&archive).context("failed to sign package")?;
        let signature_file = identity::signature_path(&archive);
        if let Err(e) = std::fs::write(&signature_file, &signature) {
            warn!(error = %e, "failed to save signature file");
        }
        Some(signature)
    } else {
        warn!("no private key specified, deploying without signature");
        None
    };

    println!("\nDeploying package to {} node(s)...", targets.len());
    let policy = ctx.retry_policy();
    let mut tasks = JoinSet::new();
    for peer in targets {
        let host = ctx.host.clone();
        let archive = archive.clone();
        let signature = signature.clone();
        tasks.spawn(async move {
            let result = client::with_retry(policy, || {
                client::deploy(&host, &peer, &archive, true, signature.clone(), None)
            })
            .await;
            (peer, result)
        });
    }

    let mut deployments: HashMap<String, String> = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        let Ok((peer, result)) = joined else { continue };
        match result {
            Ok(app_id) => {
                println!("  \u{2713} Deployed to node: {peer} (app: {app_id})");
                deployments.insert(peer, app_id);
            }
            Err(e) => println!("  \u{2717} node {peer}: {e}"),
        }
    }

    let outcome = if deployments.is_empty() {
        Err(anyhow::anyhow!("failed to deploy to any nodes"))
    } else {
        stream_all_logs(ctx, &deployments).await;
        Ok(())
    };

    if args.cleanup {
        let _ = std::fs::remove_file(&archive);
        let _ = std::fs::remove_file(identity::signature_path(&archive));
    }
    outcome
}

/// Follow logs from every deployed node, each line tagged with the first
/// 8 characters of its peer id, until Ctrl-C.
async fn stream_all_logs(ctx: &ControllerContext, deployments: &HashMap<String, String>) {
    println!(
        "\n\u{2713} Application deployed and started on {} node(s)!\n",
        deployments.len()
    );
    println!("Streaming logs from all nodes (Ctrl+C to stop):");
    println!("{}", "\u{2500}".repeat(60));

    let mut tasks = JoinSet::new();
    for (peer, app_id) in deployments {
        let host = ctx.host.clone();
        let peer = peer.clone();
        let app_id = app_id.clone();
        tasks.spawn(async move {
            let tag = short_peer_id(&peer).to_string();
            let result = client::follow_logs(&host, &peer, &app_id, 0, |chunk| {
                for line in chunk.lines() {
                    if !line.is_empty() {
                        println!("[{tag}] {line}");
                    }
                }
            })
            .await;
            if let Err(e) = result {
                warn!(peer = %peer, error = %e, "log streaming stopped");
            }
        });
    }

    let _ = tokio::signal::ctrl_c().await;
    println!("\n\nReceived interrupt signal, stopping...");
    tasks.abort_all();
}
