//! `psk` — generate the pre-shared network key.

use std::path::PathBuf;

use anyhow::{bail, Result};
use playground_core::identity;

use crate::config::ControllerConfig;

pub fn run(config: &ControllerConfig, out: Option<PathBuf>) -> Result<()> {
    let path = out.unwrap_or_else(|| config.keys.psk_file.clone());
    if path.exists() {
        bail!("PSK already exists: {}", path.display());
    }

    let psk = identity::generate_psk();
    identity::save_psk(&psk, &path)?;

    println!("PSK written to {}", path.display());
    println!("{}", identity::encode_psk(&psk));
    println!();
    println!("Copy the same value into the security.psk setting of every");
    println!("daemon and controller that should share the private network.");
    Ok(())
}
