//! Daemon configuration loaded from YAML.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use playground_core::{Error, Result};
use playground_net::DhtMode;
use serde::{Deserialize, Serialize};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Peer fabric settings.
    #[serde(default)]
    pub node: NodeConfig,

    /// On-disk layout.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Trust and signing policy.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Supervisor tuning.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Peer fabric settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name used in discovery announcements.
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Multiaddrs to listen on.
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Initial peers to dial.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Local multicast discovery.
    #[serde(default = "default_true")]
    pub enable_mdns: bool,

    /// Node labels advertised in announcements.
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Routing-layer mode.
    #[serde(default)]
    pub dht_mode: DhtMode,

    /// OS-level port mapping (UPnP).
    #[serde(default = "default_true")]
    pub enable_port_mapping: bool,

    /// Hole-punching coordination.
    #[serde(default = "default_true")]
    pub enable_hole_punching: bool,

    /// Act as a relay for other peers.
    #[serde(default = "default_true")]
    pub enable_relay_service: bool,

    /// Consume relays for inbound reachability.
    #[serde(default = "default_true")]
    pub enable_auto_relay: bool,

    /// Static relay addresses.
    #[serde(default)]
    pub static_relays: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            listen_addrs: default_listen_addrs(),
            bootstrap_peers: Vec::new(),
            enable_mdns: true,
            labels: HashMap::new(),
            dht_mode: DhtMode::default(),
            enable_port_mapping: true,
            enable_hole_punching: true,
            enable_relay_service: true,
            enable_auto_relay: true,
            static_relays: Vec::new(),
        }
    }
}

/// On-disk layout rooted at `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all daemon state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Where received archives land.
    #[must_use]
    pub fn packages_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }

    /// Where application trees are unpacked.
    #[must_use]
    pub fn apps_dir(&self) -> PathBuf {
        self.data_dir.join("apps")
    }

    /// Directory of trusted `.pub` verification keys.
    #[must_use]
    pub fn trusted_keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys").join("trusted")
    }

    /// Persistent node identity key.
    #[must_use]
    pub fn identity_key_path(&self) -> PathBuf {
        self.data_dir.join("keys").join("identity.key")
    }
}

/// Trust and signing policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Gate the transport on the pre-shared key.
    #[serde(default)]
    pub enable_auth: bool,

    /// Hex-encoded pre-shared key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,

    /// Peer ids allowed to connect; empty trusts anyone.
    #[serde(default)]
    pub trusted_peers: Vec<String>,

    /// Refuse packages without a valid signature.
    #[serde(default)]
    pub require_signed_packages: bool,
}

/// Supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// SIGTERM grace period before SIGKILL.
    #[serde(default = "default_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Settle time between the halves of a restart.
    #[serde(default = "default_restart_settle", with = "humantime_serde")]
    pub restart_settle: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stop_grace: default_stop_grace(),
            restart_settle: default_restart_settle(),
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

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "playground-node".to_string())
}

fn default_listen_addrs() -> Vec<String> {
    vec!["/ip4/0.0.0.0/tcp/9000".to_string()]
}

fn default_data_dir() -> PathBuf {
    expand_tilde(Path::new("~/.p2p-playground"))
}

const fn default_true() -> bool {
    true
}

const fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

const fn default_restart_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

impl DaemonConfig {
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
                serde_yaml::from_str(&data)?
            }
            None => Self::default(),
        };
        config.storage.data_dir = expand_tilde(&config.storage.data_dir);
        Ok(config)
    }
}

/// Expand a leading `~` to the user's home directory.
#[must_use]
pub fn expand_tilde(path: &Path) -> PathBuf {
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
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.node.listen_addrs, vec!["/ip4/0.0.0.0/tcp/9000"]);
        assert!(config.node.enable_mdns);
        assert!(!config.security.require_signed_packages);
        assert_eq!(config.runtime.stop_grace, Duration::from_secs(10));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("daemon.yaml");
        std::fs::write(
            &path,
            "node:\n  name: rack-7\nsecurity:\n  require_signed_packages: true\nruntime:\n  stop_grace: 3s\n",
        )
        .unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node.name, "rack-7");
        assert!(config.security.require_signed_packages);
        assert_eq!(config.runtime.stop_grace, Duration::from_secs(3));
        // Untouched sections keep their defaults.
        assert_eq!(config.node.listen_addrs, vec!["/ip4/0.0.0.0/tcp/9000"]);
    }

    #[test]
    fn storage_layout_derives_from_data_dir() {
        let storage = StorageConfig {
            data_dir: PathBuf::from("/var/lib/playground"),
        };
        assert_eq!(
            storage.packages_dir(),
            PathBuf::from("/var/lib/playground/packages")
        );
        assert_eq!(storage.apps_dir(), PathBuf::from("/var/lib/playground/apps"));
        assert_eq!(
            storage.trusted_keys_dir(),
            PathBuf::from("/var/lib/playground/keys/trusted")
        );
    }

    #[test]
    fn tilde_expansion() {
        if let Some(home) = std::env::var_os("HOME") {
            let expanded = expand_tilde(Path::new("~/data"));
            assert_eq!(expanded, PathBuf::from(home).join("data"));
        }
        assert_eq!(
            expand_tilde(Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }
}
