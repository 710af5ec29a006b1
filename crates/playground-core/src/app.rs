//! Application records owned by a daemon.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;

/// Lifecycle status of a deployed application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    /// Not running.
    Stopped,
    /// Spawn in progress.
    Starting,
    /// Child process alive.
    Running,
    /// Child exited with a non-zero status.
    Failed,
    /// Stop-then-start cycle in progress.
    Restarting,
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Restarting => write!(f, "restarting"),
        }
    }
}

/// A deployed, manageable unit: an unpacked archive plus its manifest and,
/// when running, a child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    /// Unique id, canonical form `"<name>-<version>"`.
    pub id: String,

    /// Application name.
    pub name: String,

    /// Semantic version string.
    pub version: String,

    /// Archive the application was deployed from, if still on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_path: Option<PathBuf>,

    /// Parsed manifest.
    pub manifest: Manifest,

    /// Current lifecycle status.
    pub status: AppStatus,

    /// OS process id, `0` when not running.
    #[serde(default)]
    pub pid: u32,

    /// Wall-clock start time of the current incarnation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Absolute work directory containing `bin/`, `logs/`, ...
    pub work_dir: PathBuf,

    /// Labels copied from the manifest.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl Application {
    /// Build a stopped application record from an unpacked manifest.
    #[must_use]
    pub fn from_manifest(
        manifest: Manifest,
        work_dir: PathBuf,
        package_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id: manifest.app_id(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            package_path,
            labels: manifest.labels.clone(),
            manifest,
            status: AppStatus::Stopped,
            pid: 0,
            started_at: None,
            work_dir,
        }
    }
}

/// Detailed status of one application, including health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatusReport {
    /// Application snapshot.
    pub app: Application,

    /// Whether the last health check passed (or the app is simply running
    /// when no health check is configured).
    pub healthy: bool,

    /// Human-readable status detail.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Timestamp of the last health check, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
}
