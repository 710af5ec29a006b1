//! Active health checking for supervised applications.
//!
//! A checker runs one of three probes on a fixed interval: process liveness
//! (signal 0), TCP connect, or HTTP GET expecting a 2xx. Failures are
//! counted consecutively; the public `healthy` flag goes false once the
//! current probe failed, and stays false until a probe succeeds again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::manifest::{CheckType, HealthCheckConfig};

/// A single health probe, dispatched by kind.
#[derive(Debug, Clone)]
pub enum CheckKind {
    /// Signal-0 liveness probe against the child pid.
    Process,
    /// HTTP GET against `http://localhost:<port><path>`, success on 2xx.
    Http {
        /// Port the application listens on.
        port: u16,
        /// Request path.
        path: String,
    },
    /// TCP connect to `localhost:<port>`.
    Tcp {
        /// Port the application listens on.
        port: u16,
    },
}

impl CheckKind {
    /// Derive the probe from a manifest health check section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the port required by the check
    /// type is not configured.
    pub fn from_config(config: &HealthCheckConfig) -> Result<Self> {
        match config.kind {
            CheckType::Process => Ok(Self::Process),
            CheckType::Http => config
                .http_port
                .map(|port| Self::Http {
                    port,
                    path: config.http_path.clone(),
                })
                .ok_or_else(|| Error::InvalidInput("HTTP port not configured".into())),
            CheckType::Tcp => config
                .tcp_port
                .map(|port| Self::Tcp { port })
                .ok_or_else(|| Error::InvalidInput("TCP port not configured".into())),
        }
    }

    /// Run the probe once within `timeout`.
    ///
    /// Returns whether the probe succeeded plus a human-readable message.
    pub async fn perform(&self, pid: u32, timeout: Duration) -> (bool, String) {
        match self {
            Self::Process => match kill(Pid::from_raw(pid as i32), None) {
                Ok(()) => (true, "process is running".into()),
                Err(e) => (false, format!("process not responding: {e}")),
            },
            Self::Tcp { port } => {
                match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", *port))).await
                {
                    Ok(Ok(_stream)) => (true, "TCP connection successful".into()),
                    Ok(Err(e)) => (false, format!("TCP connection failed: {e}")),
                    Err(_) => (false, format!("TCP connection timed out after {timeout:?}")),
                }
            }
            Self::Http { port, path } => {
                let url = format!("http://localhost:{port}{path}");
                let client = match reqwest::Client::builder().timeout(timeout).build() {
                    Ok(client) => client,
                    Err(e) => return (false, format!("failed to build HTTP client: {e}")),
                };
                match client.get(&url).send().await {
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        if (200..300).contains(&status) {
                            (true, format!("HTTP check passed (status {status})"))
                        } else {
                            (false, format!("HTTP check returned status {status}"))
                        }
                    }
                    Err(e) => (false, format!("HTTP check failed: {e}")),
                }
            }
        }
    }
}

/// Outcome of one health check tick.
#[derive(Debug, Clone)]
pub struct HealthResult {
    /// Whether the probe succeeded and the failure streak is below the
    /// retry threshold.
    pub healthy: bool,

    /// Probe detail message.
    pub message: String,

    /// When the probe ran.
    pub timestamp: DateTime<Utc>,

    /// Consecutive failures including this tick.
    pub failures: u32,
}

/// Shared handle onto the most recent health result.
pub type SharedHealth = Arc<Mutex<Option<HealthResult>>>;

/// Periodic health checker for one application process.
pub struct HealthChecker {
    kind: CheckKind,
    interval: Duration,
    timeout: Duration,
    retries: u32,
    pid: u32,
    consecutive_failures: u32,
    last: SharedHealth,
}

impl HealthChecker {
    /// Build a checker from a manifest health check section and a child pid.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is inconsistent with its check type.
    pub fn new(config: &HealthCheckConfig, pid: u32) -> Result<Self> {
        Ok(Self {
            kind: CheckKind::from_config(config)?,
            interval: config.interval,
            timeout: config.timeout,
            retries: config.retries.max(1),
            pid,
            consecutive_failures: 0,
            last: Arc::new(Mutex::new(None)),
        })
    }

    /// Handle onto the latest result, for status reporting.
    #[must_use]
    pub fn shared(&self) -> SharedHealth {
        Arc::clone(&self.last)
    }

    /// Run one probe and update the failure accounting.
    pub async fn check(&mut self) -> HealthResult {
        let (ok, message) = self.kind.perform(self.pid, self.timeout).await;
        if ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }

        let result = HealthResult {
            healthy: ok && self.consecutive_failures < self.retries,
            message,
            timestamp: Utc::now(),
            failures: self.consecutive_failures,
        };
        *self.last.lock().unwrap() = Some(result.clone());
        result
    }

    /// Loop on the configured interval until `stop` fires, invoking
    /// `on_unhealthy` on every failing tick with the current counter.
    pub async fn monitor<F>(mut self, mut stop: watch::Receiver<bool>, on_unhealthy: F)
    where
        F: Fn(&HealthResult) + Send + 'static,
    {
        info!(
            kind = %check_name(&self.kind),
            interval = ?self.interval,
            retries = self.retries,
            "starting health monitoring"
        );

        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("stopping health monitoring");
                    return;
                }
                _ = ticker.tick() => {
                    let result = self.check().await;
                    if result.healthy {
                        debug!(message = %result.message, "health check passed");
                    } else {
                        warn!(
                            message = %result.message,
                            failures = result.failures,
                            threshold = self.retries,
                            "application unhealthy"
                        );
                        on_unhealthy(&result);
                    }
                }
            }
        }
    }

    /// Retry threshold this checker was configured with.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }
}

fn check_name(kind: &CheckKind) -> &'static str {
    match kind {
        CheckKind::Process => "process",
        CheckKind::Http { .. } => "http",
        CheckKind::Tcp { .. } => "tcp",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: CheckType) -> HealthCheckConfig {
        HealthCheckConfig {
            kind,
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(200),
            retries: 3,
            http_port: Some(8080),
            http_path: "/health".into(),
            tcp_port: Some(8080),
        }
    }

    #[tokio::test]
    async fn process_check_sees_own_pid() {
        let mut checker = HealthChecker::new(&config(CheckType::Process), std::process::id())
            .unwrap();
        let result = checker.check().await;
        assert!(result.healthy);
        assert_eq!(result.failures, 0);
    }

    #[tokio::test]
    async fn process_check_fails_for_dead_pid() {
        // Pid numbers near the maximum are essentially never live.
        let mut checker = HealthChecker::new(&config(CheckType::Process), 0x3fff_fff0).unwrap();
        let result = checker.check().await;
        assert!(!result.healthy);
        assert_eq!(result.failures, 1);
    }

    #[tokio::test]
    async fn tcp_check_against_bound_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut cfg = config(CheckType::Tcp);
        cfg.tcp_port = Some(port);
        let mut checker = HealthChecker::new(&cfg, std::process::id()).unwrap();
        let result = checker.check().await;
        assert!(result.healthy, "{}", result.message);
        drop(listener);
    }

    #[tokio::test]
    async fn failure_counter_gates_healthy_flag() {
        // A closed port: connect refused immediately.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = config(CheckType::Tcp);
        cfg.tcp_port = Some(port);
        cfg.retries = 2;
        let mut checker = HealthChecker::new(&cfg, std::process::id()).unwrap();

        let first = checker.check().await;
        assert!(!first.healthy);
        assert_eq!(first.failures, 1);

        let second = checker.check().await;
        assert_eq!(second.failures, 2);
        assert!(!second.healthy);

        // A success resets the counter.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
        if let Ok(listener) = listener {
            let ok = checker.check().await;
            assert!(ok.healthy);
            assert_eq!(ok.failures, 0);
            drop(listener);
        }
    }

    #[test]
    fn http_kind_requires_port() {
        let mut cfg = config(CheckType::Http);
        cfg.http_port = None;
        assert!(matches!(
            CheckKind::from_config(&cfg),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn monitor_reports_every_failing_tick() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = config(CheckType::Tcp);
        cfg.tcp_port = Some(port);
        cfg.interval = Duration::from_millis(20);
        let checker = HealthChecker::new(&cfg, std::process::id()).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (tick_tx, mut tick_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = tokio::spawn(checker.monitor(stop_rx, move |result| {
            let _ = tick_tx.send(result.failures);
        }));

        let first = tokio::time::timeout(Duration::from_secs(2), tick_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), tick_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
