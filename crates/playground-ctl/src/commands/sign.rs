//! `sign` — produce the detached signature sidecar for a package.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use playground_core::identity::{self, Signer};

use crate::config::ControllerConfig;

pub fn run(config: &ControllerConfig, package: PathBuf, key: Option<PathBuf>) -> Result<()> {
    let key_path = key.unwrap_or_else(|| config.keys.keys_dir.join("controller.key"));
    let signer = Signer::load(&key_path)
        .with_context(|| format!("failed to load private key {}", key_path.display()))?;

    let signature = signer.sign_file(&package).context("failed to sign package")?;
    let signature_file = identity::signature_path(&package);
    std::fs::write(&signature_file, &signature)?;

    println!("signed {}", package.display());
    println!("signature: {}", signature_file.display());
    Ok(())
}
