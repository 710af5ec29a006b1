//! `keygen` — generate the controller signing keypair.

use std::path::PathBuf;

use anyhow::{bail, Result};
use playground_core::identity::Signer;

use crate::config::ControllerConfig;

pub fn run(config: &ControllerConfig, out_dir: Option<PathBuf>) -> Result<()> {
    let dir = out_dir.unwrap_or_else(|| config.keys.keys_dir.clone());
    let key_path = dir.join("controller.key");
    if key_path.exists() {
        bail!("key already exists: {}", key_path.display());
    }

    let signer = Signer::generate();
    signer.save(&dir, "controller")?;

    println!("private key: {}", key_path.display());
    println!("public key:  {}", dir.join("controller.pub").display());
    println!("fingerprint: {}", hex::encode(signer.public_key_bytes()));
    println!();
    println!("Install the public key on each daemon under keys/trusted/ to");
    println!("let it verify packages signed with this key.");
    Ok(())
}
