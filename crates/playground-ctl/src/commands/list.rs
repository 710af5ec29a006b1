//! `list` — show the applications deployed on nodes.

use anyhow::Result;
use playground_net::protocol::client;

use crate::context::{short_peer_id, ControllerContext};

pub async fn run(ctx: &ControllerContext, node: Option<String>) -> Result<()> {
    let targets = ctx.resolve_targets(node).await?;

    for peer in targets {
        match client::list_apps(&ctx.host, &peer).await {
            Ok(apps) => {
                println!("\nNode {} ({} app(s)):", short_peer_id(&peer), apps.len());
                if apps.is_empty() {
                    println!("  (none)");
                    continue;
                }
                println!("  {:<28} {:<12} {:>8}  {}", "ID", "STATUS", "PID", "STARTED");
                for app in apps {
                    let started = app
                        .started_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "  {:<28} {:<12} {:>8}  {}",
                        app.id, app.status, app.pid, started
                    );
                }
            }
            Err(e) => {
                println!("\nNode {}: \u{2717} {e}", short_peer_id(&peer));
            }
        }
    }
    Ok(())
}
