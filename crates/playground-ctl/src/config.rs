//! Controller configuration loaded from YAML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use playground_core::{Error, Result};
use playground_net::DhtMode;
use serde::{Deserialize, Serialize};

/// Top-level controller configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Peer fabric settings.
    #[serde(default)]
    pub node: NodeConfig,

    /// Transport security settings.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Key material locations.
    #[serde(default)]
    pub keys: KeysConfig,

    /// Deployment behavior.
    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Peer fabric settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Multiaddrs to listen on; an ephemeral port by default.
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Initial peers to dial.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Local multicast discovery.
    #[serde(default = "default_true")]
    pub enable_mdns: bool,

    /// Routing-layer mode.
    #[serde(default)]
    pub dht_mode: DhtMode,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            bootstrap_peers: Vec::new(),
            enable_mdns: true,
            dht_mode: DhtMode::default(),
        }
    }
}

/// Transport security settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Gate the transport on the pre-shared key.
    #[serde(default)]
    pub enable_auth: bool,

    /// Hex-encoded pre-shared key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
}

/// Key material locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Directory holding `controller.key` / `controller.pub`.
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    /// File holding the hex-encoded network PSK.
    #[serde(default = "default_psk_file")]
    pub psk_file: PathBuf,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            keys_dir: default_keys_dir(),
            psk_file: default_psk_file(),
        }
    }
}

/// Deployment behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Per-peer deploy deadline.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Attempts per peer for transport failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between attempts.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// How long to let discovery settle before snapshotting peers.
    #[serde(default = "default_discovery_wait", with = "humantime_serde")]
    pub discovery_wait: Duration,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            discovery_wait: default_discovery_wait(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (`trace` .. `error`).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `console` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_listen_addrs() -> Vec<String> {
    vec!["/ip4/0.0.0.0/tcp/0".to_string()]
}

const fn default_true() -> bool {
    true
}

fn default_keys_dir() -> PathBuf {
    expand_tilde(Path::new("~/.p2p-playground-controller/keys"))
}

fn default_psk_file() -> PathBuf {
    expand_tilde(Path::new("~/.p2p-playground-controller/psk"))
}

const fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_retry_attempts() -> u32 {
    3
}

const fn default_retry_delay() -> Duration {
    Duration::from_secs(10)
}

const fn default_discovery_wait() -> Duration {
    Duration::from_secs(3)
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

impl ControllerConfig {
    /// Load the configuration, falling back to defaults without a file.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path).map_err(|e| {
                    Error::InvalidInput(format!("cannot read config {}: {e}", path.display()))
                })?;
                serde_yaml::from_str::<Self>(&data)?
            }
            None => Self::default(),
        };
        config.keys.keys_dir = expand_tilde(&config.keys.keys_dir);
        config.keys.psk_file = expand_tilde(&config.keys.psk_file);
        Ok(config)
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(stripped),
        None => path.to_path_buf(),
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = ControllerConfig::load(None).unwrap();
        assert_eq!(config.node.listen_addrs, vec!["/ip4/0.0.0.0/tcp/0"]);
        assert_eq!(config.deployment.retry_attempts, 3);
        assert_eq!(config.deployment.discovery_wait, Duration::from_secs(3));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn file_overrides_deployment_section() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("controller.yaml");
        std::fs::write(
            &path,
            "deployment:\n  retry_attempts: 5\n  retry_delay: 2s\n",
        )
        .unwrap();

        let config = ControllerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.deployment.retry_attempts, 5);
        assert_eq!(config.deployment.retry_delay, Duration::from_secs(2));
        assert_eq!(config.deployment.timeout, Duration::from_secs(300));
    }
}
