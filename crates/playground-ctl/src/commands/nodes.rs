//! `nodes` — show the nodes currently visible through discovery.

use anyhow::Result;

use crate::context::ControllerContext;

pub async fn run(ctx: &ControllerContext) -> Result<()> {
    println!("Discovering nodes...");
    tokio::time::sleep(ctx.config.deployment.discovery_wait).await;

    let mut nodes = ctx.discovery.nodes();
    if nodes.is_empty() {
        // Fall back to raw connections for peers that have not announced yet.
        let peers = ctx.host.peers().await;
        if peers.is_empty() {
            println!("No nodes discovered");
            return Ok(());
        }
        println!("\n{} connected peer(s):", peers.len());
        for peer in peers {
            println!("  {} ({})", peer.id, peer.addrs.join(", "));
        }
        return Ok(());
    }

    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    println!("\n{} node(s):", nodes.len());
    for node in nodes {
        println!("  {} ({})", node.name, node.peer_id);
        if !node.version.is_empty() {
            println!("    version: {}", node.version);
        }
        for addr in &node.addrs {
            println!("    addr: {addr}");
        }
        for (key, value) in &node.labels {
            println!("    label: {key}={value}");
        }
        println!("    last seen: {:.0?} ago", node.last_seen.elapsed());
    }
    Ok(())
}
