//! Application manifest model.
//!
//! Every package carries a `manifest.yaml` at its root describing how to run
//! the application. `name`, `version` and `entrypoint` are mandatory;
//! everything else is optional. Durations are humantime strings (`"30s"`).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name of the manifest inside every package.
pub const MANIFEST_FILE: &str = "manifest.yaml";

/// Describes an application package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Application name.
    #[serde(default)]
    pub name: String,

    /// Semantic version (opaque string).
    #[serde(default)]
    pub version: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Main executable, relative to the package root.
    #[serde(default)]
    pub entrypoint: String,

    /// Command-line arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables merged over the daemon's environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Resource limits (carried, not enforced).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,

    /// Health check configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,

    /// Lifecycle hook scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<LifecycleHooks>,

    /// Names of applications this one depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Key-value labels for organization.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl Manifest {
    /// Parse a manifest from YAML and validate the required fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManifest`] when the document does not parse or
    /// a required field is missing.
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        let manifest: Self = serde_yaml::from_slice(data)
            .map_err(|e| Error::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the required fields and the health check configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManifest`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidManifest("missing name".into()));
        }
        if self.version.is_empty() {
            return Err(Error::InvalidManifest("missing version".into()));
        }
        if self.entrypoint.is_empty() {
            return Err(Error::InvalidManifest("missing entrypoint".into()));
        }
        if let Some(hc) = &self.health_check {
            hc.validate()?;
        }
        Ok(())
    }

    /// Canonical application id, `"<name>-<version>"`.
    #[must_use]
    pub fn app_id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// Resource limits declared by the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit as a percentage (0-100 per core).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,

    /// Memory limit in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
}

/// Scripts run at lifecycle transitions, relative to the work directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleHooks {
    /// Runs before the application starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_start: Option<String>,

    /// Runs after the application started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_start: Option<String>,

    /// Runs before the application is stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_stop: Option<String>,

    /// Runs after the application stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_stop: Option<String>,
}

/// Kind of health check declared by a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// Process liveness via signal 0.
    Process,
    /// HTTP GET against `http://localhost:<http_port><http_path>`.
    Http,
    /// TCP connect to `localhost:<tcp_port>`.
    Tcp,
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Http => write!(f, "http"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// How to check application health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Check kind.
    #[serde(rename = "type")]
    pub kind: CheckType,

    /// Interval between checks.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Per-check deadline.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive failures before the application counts as unhealthy.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Port for HTTP checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,

    /// Path for HTTP checks.
    #[serde(default = "default_http_path")]
    pub http_path: String,

    /// Port for TCP checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

const fn default_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_retries() -> u32 {
    3
}

fn default_http_path() -> String {
    "/health".to_string()
}

impl HealthCheckConfig {
    /// Validate the configuration against its check kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManifest`] when `retries` is zero or the port
    /// required by the check kind is absent.
    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            return Err(Error::InvalidManifest(
                "health_check retries must be at least 1".into(),
            ));
        }
        match self.kind {
            CheckType::Http if self.http_port.is_none() => Err(Error::InvalidManifest(
                "health_check type http requires http_port".into(),
            )),
            CheckType::Tcp if self.tcp_port.is_none() => Err(Error::InvalidManifest(
                "health_check type tcp requires tcp_port".into(),
            )),
            _ => Ok(()),
        }
    }
}

pub(crate) mod humantime_serde {
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

    const FULL: &str = r#"
name: hello-world
version: 1.0.0
entrypoint: bin/hello-world
args: ["--port", "8080"]
env:
  GREETING: hi
health_check:
  type: http
  http_port: 8080
  http_path: /health
  interval: 1s
  timeout: 500ms
  retries: 3
labels:
  team: infra
"#;

    #[test]
    fn parse_full_manifest() {
        let m = Manifest::from_yaml(FULL.as_bytes()).unwrap();
        assert_eq!(m.app_id(), "hello-world-1.0.0");
        assert_eq!(m.args, vec!["--port", "8080"]);
        assert_eq!(m.env.get("GREETING").map(String::as_str), Some("hi"));

        let hc = m.health_check.unwrap();
        assert_eq!(hc.kind, CheckType::Http);
        assert_eq!(hc.http_port, Some(8080));
        assert_eq!(hc.interval, Duration::from_secs(1));
        assert_eq!(hc.timeout, Duration::from_millis(500));
        assert_eq!(hc.retries, 3);
    }

    #[test]
    fn missing_required_fields() {
        for (yaml, field) in [
            ("version: 1.0.0\nentrypoint: bin/app", "name"),
            ("name: app\nentrypoint: bin/app", "version"),
            ("name: app\nversion: 1.0.0", "entrypoint"),
        ] {
            let err = Manifest::from_yaml(yaml.as_bytes()).unwrap_err();
            match err {
                Error::InvalidManifest(msg) => assert!(msg.contains(field), "{msg}"),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn health_check_defaults() {
        let yaml = "name: a\nversion: 1\nentrypoint: bin/a\nhealth_check:\n  type: process\n";
        let m = Manifest::from_yaml(yaml.as_bytes()).unwrap();
        let hc = m.health_check.unwrap();
        assert_eq!(hc.interval, Duration::from_secs(30));
        assert_eq!(hc.timeout, Duration::from_secs(5));
        assert_eq!(hc.retries, 3);
        assert_eq!(hc.http_path, "/health");
    }

    #[test]
    fn http_check_requires_port() {
        let yaml = "name: a\nversion: 1\nentrypoint: bin/a\nhealth_check:\n  type: http\n";
        assert!(matches!(
            Manifest::from_yaml(yaml.as_bytes()),
            Err(Error::InvalidManifest(_))
        ));
    }

    #[test]
    fn zero_retries_rejected() {
        let yaml =
            "name: a\nversion: 1\nentrypoint: bin/a\nhealth_check:\n  type: process\n  retries: 0\n";
        assert!(matches!(
            Manifest::from_yaml(yaml.as_bytes()),
            Err(Error::InvalidManifest(_))
        ));
    }
}
