//! `logs` — fetch or follow an application's logs from a node.

use anyhow::{bail, Result};
use playground_net::protocol::client;

use crate::context::ControllerContext;

pub async fn run(
    ctx: &ControllerContext,
    app_id: String,
    node: Option<String>,
    follow: bool,
    tail: u64,
) -> Result<()> {
    let targets = ctx.resolve_targets(node).await?;
    let peer = match targets.as_slice() {
        [single] => single.clone(),
        _ => bail!("multiple nodes discovered; pick one with --node"),
    };

    if follow {
        let streaming = client::follow_logs(&ctx.host, &peer, &app_id, tail, |chunk| {
            print!("{chunk}");
            if !chunk.ends_with('\n') {
                println!();
            }
        });
        tokio::select! {
            result = streaming => result?,
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        let logs = client::fetch_logs(&ctx.host, &peer, &app_id, tail).await?;
        print!("{logs}");
        if !logs.is_empty() && !logs.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}
