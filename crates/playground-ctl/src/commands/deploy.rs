//! `deploy` — push a prebuilt package to one or all discovered nodes.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use playground_core::identity;
use playground_net::protocol::client;
use tokio::task::JoinSet;
use tracing::warn;

use crate::context::ControllerContext;

pub async fn run(
    ctx: &ControllerContext,
    package: PathBuf,
    node: Option<String>,
    start: bool,
) -> Result<()> {
    let targets = ctx.resolve_targets(node).await?;

    // Pick up the sidecar signature when one exists.
    let signature_file = identity::signature_path(&package);
    let signature = match std::fs::read(&signature_file) {
        Ok(signature) => Some(signature),
        Err(_) => {
            warn!("no package signature found, deploying without signature verification");
            None
        }
    };

    println!("\nDeploying package to {} node(s)...", targets.len());
    let policy = ctx.retry_policy();

    let mut tasks = JoinSet::new();
    for peer in targets {
        let host = ctx.host.clone();
        let package = package.clone();
        let signature = signature.clone();
        tasks.spawn(async move {
            let result = client::with_retry(policy, || {
                client::deploy(&host, &peer, &package, start, signature.clone(), None)
            })
            .await;
            (peer, result)
        });
    }

    let mut deployments: HashMap<String, String> = HashMap::new();
    let mut failures = 0usize;
    while let Some(joined) = tasks.join_next().await {
        let Ok((peer, result)) = joined else { continue };
        match result {
            Ok(app_id) => {
                println!("  \u{2713} Deployed to node: {peer} (app: {app_id})");
                deployments.insert(peer, app_id);
            }
            Err(e) => {
                println!("  \u{2717} node {peer}: {e}");
                failures += 1;
            }
        }
    }

    if deployments.is_empty() {
        bail!("failed to deploy to any nodes");
    }
    println!(
        "\nDeployed to {} node(s), {} failure(s)",
        deployments.len(),
        failures
    );
    Ok(())
}
