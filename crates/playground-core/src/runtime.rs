//! Application runtime: process lifecycle, log capture and supervision.
//!
//! The app table sits behind a single mutex that is only ever held for
//! in-memory mutations and snapshot reads, never across a suspension point.
//! Health monitors do not hold a runtime reference; they post the app id to
//! an event queue the runtime drains, which breaks the monitor -> runtime
//! cycle.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::app::{AppStatus, AppStatusReport, Application};
use crate::error::{Error, Result};
use crate::health::{HealthChecker, SharedHealth};

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long to wait after SIGTERM before sending SIGKILL.
    pub stop_grace: Duration,

    /// Settle time between the stop and start halves of a restart.
    pub restart_settle: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            restart_settle: Duration::from_secs(1),
        }
    }
}

struct AppEntry {
    app: Application,
    auto_restart: bool,
    stop_health: Option<watch::Sender<bool>>,
    exited: Option<watch::Receiver<bool>>,
    health: Option<SharedHealth>,
}

struct Inner {
    config: RuntimeConfig,
    apps: Mutex<HashMap<String, AppEntry>>,
    events: mpsc::UnboundedSender<String>,
}

/// Supervisor for deployed applications. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Create a runtime and spawn its restart-event drain task.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let (events, mut event_rx) = mpsc::unbounded_channel::<String>();
        let inner = Arc::new(Inner {
            config,
            apps: Mutex::new(HashMap::new()),
            events,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(app_id) = event_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let runtime = Runtime { inner };
                // A queued event must not resurrect an app that was stopped
                // explicitly in the meantime.
                let still_running = {
                    let apps = runtime.inner.apps.lock().unwrap();
                    apps.get(&app_id)
                        .is_some_and(|entry| entry.app.status == AppStatus::Running)
                };
                if !still_running {
                    continue;
                }
                if let Err(e) = runtime.restart(&app_id).await {
                    error!(app_id = %app_id, error = %e, "failed to auto-restart application");
                }
            }
        });

        Self { inner }
    }

    /// Register a deployed application record.
    ///
    /// An existing record is replaced unless its process is running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AppAlreadyRunning`] when a running record with the
    /// same id exists.
    pub fn register(&self, app: Application) -> Result<()> {
        let mut apps = self.inner.apps.lock().unwrap();
        if let Some(existing) = apps.get(&app.id) {
            if existing.app.status == AppStatus::Running {
                return Err(Error::AppAlreadyRunning(app.id));
            }
        }
        apps.insert(
            app.id.clone(),
            AppEntry {
                app,
                auto_restart: false,
                stop_health: None,
                exited: None,
                health: None,
            },
        );
        Ok(())
    }

    /// Start a registered application.
    ///
    /// With `auto_restart` and a manifest health check, the supervisor
    /// restarts the application once the consecutive-failure threshold is
    /// reached.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] for an unknown id,
    /// [`Error::AppAlreadyRunning`] when the process is already up, and
    /// [`Error::AppStartFailed`] when the spawn fails.
    pub async fn start(&self, app_id: &str, auto_restart: bool) -> Result<()> {
        let app = {
            let mut apps = self.inner.apps.lock().unwrap();
            let entry = apps
                .get_mut(app_id)
                .ok_or_else(|| Error::NotFound(format!("application {app_id}")))?;
            if matches!(entry.app.status, AppStatus::Running | AppStatus::Starting) {
                return Err(Error::AppAlreadyRunning(app_id.to_string()));
            }
            entry.app.status = AppStatus::Starting;
            entry.auto_restart = auto_restart;
            entry.app.clone()
        };

        if let Some(script) = app.manifest.hooks.as_ref().and_then(|h| h.pre_start.clone()) {
            run_hook(&app.work_dir, &script, "pre_start").await;
        }

        match self.spawn(&app, auto_restart).await {
            Ok(()) => {
                if let Some(script) = app
                    .manifest
                    .hooks
                    .as_ref()
                    .and_then(|h| h.post_start.clone())
                {
                    run_hook(&app.work_dir, &script, "post_start").await;
                }
                Ok(())
            }
            Err(e) => {
                let mut apps = self.inner.apps.lock().unwrap();
                if let Some(entry) = apps.get_mut(app_id) {
                    entry.app.status = AppStatus::Failed;
                }
                Err(e)
            }
        }
    }

    async fn spawn(&self, app: &Application, auto_restart: bool) -> Result<()> {
        let logs_dir = app.work_dir.join("logs");
        tokio::fs::create_dir_all(&logs_dir).await?;
        let stdout = append_log(&logs_dir.join("stdout.log"))?;
        let stderr = append_log(&logs_dir.join("stderr.log"))?;

        let entry_path = app.work_dir.join(&app.manifest.entrypoint);
        let mut command = Command::new(&entry_path);
        command
            .args(&app.manifest.args)
            .envs(&app.manifest.env)
            .current_dir(&app.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);

        let mut child = command
            .spawn()
            .map_err(|e| Error::AppStartFailed(format!("{}: {e}", entry_path.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::AppStartFailed("child exited before pid was known".into()))?;

        let (exit_tx, exit_rx) = watch::channel(false);

        let mut stop_health = None;
        let mut shared_health = None;
        if let Some(hc) = &app.manifest.health_check {
            let checker = HealthChecker::new(hc, pid)?;
            shared_health = Some(checker.shared());
            let (stop_tx, stop_rx) = watch::channel(false);
            stop_health = Some(stop_tx);

            let retries = checker.retries();
            let events = self.inner.events.clone();
            let id = app.id.clone();
            // Act exactly once per incarnation, at the threshold crossing;
            // later failing ticks belong to the same outage.
            tokio::spawn(checker.monitor(stop_rx, move |result| {
                if auto_restart && result.failures == retries {
                    warn!(
                        app_id = %id,
                        failures = result.failures,
                        "application unhealthy, triggering restart"
                    );
                    let _ = events.send(id.clone());
                }
            }));
        }

        {
            let mut apps = self.inner.apps.lock().unwrap();
            let Some(entry) = apps.get_mut(&app.id) else {
                let _ = child.start_kill();
                return Err(Error::NotFound(format!("application {}", app.id)));
            };
            entry.app.pid = pid;
            entry.app.status = AppStatus::Running;
            entry.app.started_at = Some(Utc::now());
            entry.auto_restart = auto_restart;
            entry.stop_health = stop_health;
            entry.exited = Some(exit_rx);
            entry.health = shared_health;
        }

        info!(app_id = %app.id, pid, "application started");

        let weak = Arc::downgrade(&self.inner);
        let id = app.id.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            if let Some(inner) = weak.upgrade() {
                let mut apps = inner.apps.lock().unwrap();
                if let Some(entry) = apps.get_mut(&id) {
                    // Guard against a newer incarnation of the same app.
                    if entry.app.pid == pid {
                        if let Some(stop) = entry.stop_health.take() {
                            let _ = stop.send(true);
                        }
                        entry.app.pid = 0;
                        match &status {
                            Ok(s) if s.success() => {
                                entry.app.status = AppStatus::Stopped;
                                info!(app_id = %id, "application stopped");
                            }
                            Ok(s) => {
                                entry.app.status = AppStatus::Failed;
                                error!(app_id = %id, status = %s, "application exited with error");
                            }
                            Err(e) => {
                                entry.app.status = AppStatus::Failed;
                                error!(app_id = %id, error = %e, "failed to observe application exit");
                            }
                        }
                    }
                }
            }
            let _ = exit_tx.send(true);
        });

        Ok(())
    }

    /// Stop a running application: SIGTERM, bounded grace, then SIGKILL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AppNotRunning`] when the application is registered
    /// but not running (which makes a second stop harmless) and
    /// [`Error::NotFound`] for an unknown id.
    pub async fn stop(&self, app_id: &str) -> Result<()> {
        let (app, exited) = {
            let mut apps = self.inner.apps.lock().unwrap();
            let entry = apps
                .get_mut(app_id)
                .ok_or_else(|| Error::NotFound(format!("application {app_id}")))?;
            if entry.app.status != AppStatus::Running {
                return Err(Error::AppNotRunning(app_id.to_string()));
            }
            if let Some(stop) = entry.stop_health.take() {
                let _ = stop.send(true);
            }
            (entry.app.clone(), entry.exited.clone())
        };

        if let Some(script) = app.manifest.hooks.as_ref().and_then(|h| h.pre_stop.clone()) {
            run_hook(&app.work_dir, &script, "pre_stop").await;
        }

        let pid = Pid::from_raw(app.pid as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!(app_id = %app_id, error = %e, "SIGTERM not delivered");
        }

        let mut exited =
            exited.ok_or_else(|| Error::Internal(format!("no exit channel for {app_id}")))?;
        let grace = self.inner.config.stop_grace;
        let stopped_gracefully = tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_ok();
        match stopped_gracefully {
            true => info!(app_id = %app_id, "application stopped gracefully"),
            false => {
                warn!(app_id = %app_id, "application did not stop gracefully, forcing kill");
                let _ = kill(pid, Signal::SIGKILL);
                let _ =
                    tokio::time::timeout(Duration::from_secs(5), exited.wait_for(|done| *done))
                        .await;
            }
        }

        {
            let mut apps = self.inner.apps.lock().unwrap();
            if let Some(entry) = apps.get_mut(app_id) {
                entry.app.status = AppStatus::Stopped;
                entry.app.pid = 0;
            }
        }

        if let Some(script) = app.manifest.hooks.as_ref().and_then(|h| h.post_stop.clone()) {
            run_hook(&app.work_dir, &script, "post_stop").await;
        }

        Ok(())
    }

    /// Stop (ignoring "not running") and start again, preserving the stored
    /// `auto_restart` flag.
    ///
    /// # Errors
    ///
    /// Propagates stop and start failures.
    pub async fn restart(&self, app_id: &str) -> Result<()> {
        let auto_restart = {
            let apps = self.inner.apps.lock().unwrap();
            let entry = apps
                .get(app_id)
                .ok_or_else(|| Error::NotFound(format!("application {app_id}")))?;
            entry.auto_restart
        };

        match self.stop(app_id).await {
            Ok(()) | Err(Error::AppNotRunning(_)) => {}
            Err(e) => return Err(e),
        }

        {
            let mut apps = self.inner.apps.lock().unwrap();
            if let Some(entry) = apps.get_mut(app_id) {
                entry.app.status = AppStatus::Restarting;
            }
        }

        tokio::time::sleep(self.inner.config.restart_settle).await;
        self.start(app_id, auto_restart).await
    }

    /// Latest status of one application, including the last health result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn status(&self, app_id: &str) -> Result<AppStatusReport> {
        let apps = self.inner.apps.lock().unwrap();
        let entry = apps
            .get(app_id)
            .ok_or_else(|| Error::NotFound(format!("application {app_id}")))?;

        let mut report = AppStatusReport {
            healthy: entry.app.status == AppStatus::Running,
            message: entry.app.status.to_string(),
            last_health_check: None,
            app: entry.app.clone(),
        };
        if let Some(shared) = &entry.health {
            if let Some(last) = shared.lock().unwrap().clone() {
                report.healthy = last.healthy;
                report.message = last.message;
                report.last_health_check = Some(last.timestamp);
            }
        }
        Ok(report)
    }

    /// Snapshot of all application records.
    #[must_use]
    pub fn list(&self) -> Vec<Application> {
        let apps = self.inner.apps.lock().unwrap();
        apps.values().map(|entry| entry.app.clone()).collect()
    }

    /// Full contents of an application's stdout log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id or a missing log file.
    pub async fn logs(&self, app_id: &str) -> Result<Vec<u8>> {
        let path = self.log_path(app_id)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("log file {}", path.display()))
            } else {
                Error::Io(e)
            }
        })
    }

    /// Follow an application's stdout log: seek to the end, then poll for
    /// new bytes every 500ms until `stop` fires or the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id or a missing log file.
    pub async fn follow_logs(
        &self,
        app_id: &str,
        mut stop: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let path = self.log_path(app_id)?;
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("log file {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        file.seek(std::io::SeekFrom::End(0)).await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = ticker.tick() => loop {
                        match file.read(&mut buf).await {
                            Ok(0) => break,
                            Ok(n) => {
                                if tx.send(buf[..n].to_vec()).await.is_err() {
                                    return;
                                }
                            }
                            Err(_) => return,
                        }
                    },
                }
            }
        });
        Ok(rx)
    }

    fn log_path(&self, app_id: &str) -> Result<std::path::PathBuf> {
        let apps = self.inner.apps.lock().unwrap();
        let entry = apps
            .get(app_id)
            .ok_or_else(|| Error::NotFound(format!("application {app_id}")))?;
        Ok(entry.app.work_dir.join("logs").join("stdout.log"))
    }

    #[cfg(test)]
    fn auto_restart_flag(&self, app_id: &str) -> Option<bool> {
        let apps = self.inner.apps.lock().unwrap();
        apps.get(app_id).map(|entry| entry.auto_restart)
    }
}

fn append_log(path: &Path) -> Result<std::fs::File> {
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}

async fn run_hook(work_dir: &Path, script: &str, name: &str) {
    let path = work_dir.join(script);
    let status = Command::new(&path)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) if s.success() => debug!(hook = name, "hook completed"),
        Ok(s) => warn!(hook = name, status = %s, "hook exited with error"),
        Err(e) => warn!(hook = name, error = %e, "hook failed to run"),
    }
}

/// Keep at most the last `n` non-empty newline-separated lines.
///
/// `n == 0` returns the content unchanged.
#[must_use]
pub fn tail_lines(content: &str, n: u64) -> String {
    if n == 0 {
        return content.to_string();
    }
    let lines: Vec<&str> = content.lines().filter(|line| !line.is_empty()).collect();
    let skip = lines.len().saturating_sub(n as usize);
    lines[skip..].join("\n")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::manifest::Manifest;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            stop_grace: Duration::from_millis(400),
            restart_settle: Duration::from_millis(50),
        }
    }

    fn make_app(root: &Path, name: &str, script: &str) -> Application {
        let work_dir = root.join(name);
        fs::create_dir_all(work_dir.join("bin")).unwrap();

        let script_path = work_dir.join("bin/run.sh");
        fs::write(&script_path, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).unwrap();

        let manifest = Manifest::from_yaml(
            format!("name: {name}\nversion: 1.0.0\nentrypoint: bin/run.sh\n").as_bytes(),
        )
        .unwrap();
        Application::from_manifest(manifest, work_dir, None)
    }

    async fn wait_for_status(runtime: &Runtime, app_id: &str, status: AppStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if runtime.status(app_id).unwrap().app.status == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {status}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config());
        let app = make_app(dir.path(), "sleeper", "exec sleep 30");
        let id = app.id.clone();

        runtime.register(app).unwrap();
        runtime.start(&id, false).await.unwrap();

        let report = runtime.status(&id).unwrap();
        assert_eq!(report.app.status, AppStatus::Running);
        assert!(report.app.pid > 0);
        assert!(report.app.started_at.is_some());

        runtime.stop(&id).await.unwrap();
        let report = runtime.status(&id).unwrap();
        assert_eq!(report.app.status, AppStatus::Stopped);
        assert_eq!(report.app.pid, 0);
    }

    #[tokio::test]
    async fn second_stop_reports_not_running() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config());
        let app = make_app(dir.path(), "once", "exec sleep 30");
        let id = app.id.clone();

        runtime.register(app).unwrap();
        runtime.start(&id, false).await.unwrap();
        runtime.stop(&id).await.unwrap();

        assert!(matches!(
            runtime.stop(&id).await,
            Err(Error::AppNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config());
        let app = make_app(dir.path(), "dup", "exec sleep 30");
        let id = app.id.clone();

        runtime.register(app).unwrap();
        runtime.start(&id, false).await.unwrap();
        assert!(matches!(
            runtime.start(&id, false).await,
            Err(Error::AppAlreadyRunning(_))
        ));
        runtime.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn clean_exit_becomes_stopped() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config());
        let app = make_app(dir.path(), "quick", "exit 0");
        let id = app.id.clone();

        runtime.register(app).unwrap();
        runtime.start(&id, false).await.unwrap();
        wait_for_status(&runtime, &id, AppStatus::Stopped).await;
        assert_eq!(runtime.status(&id).unwrap().app.pid, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_becomes_failed() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config());
        let app = make_app(dir.path(), "broken", "exit 3");
        let id = app.id.clone();

        runtime.register(app).unwrap();
        runtime.start(&id, false).await.unwrap();
        wait_for_status(&runtime, &id, AppStatus::Failed).await;
    }

    #[tokio::test]
    async fn sigterm_ignorer_is_force_killed() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config());
        let app = make_app(
            dir.path(),
            "stubborn",
            "trap '' TERM\nwhile true; do sleep 0.1; done",
        );
        let id = app.id.clone();

        runtime.register(app).unwrap();
        runtime.start(&id, false).await.unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = tokio::time::Instant::now();
        runtime.stop(&id).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(350), "stop was too fast");

        let report = runtime.status(&id).unwrap();
        assert_eq!(report.app.status, AppStatus::Stopped);
        assert_eq!(report.app.pid, 0);
    }

    #[tokio::test]
    async fn restart_changes_pid_and_preserves_auto_restart() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config());
        let app = make_app(dir.path(), "phoenix", "exec sleep 30");
        let id = app.id.clone();

        runtime.register(app).unwrap();
        runtime.start(&id, true).await.unwrap();
        let first_pid = runtime.status(&id).unwrap().app.pid;

        runtime.restart(&id).await.unwrap();
        let report = runtime.status(&id).unwrap();
        assert_eq!(report.app.status, AppStatus::Running);
        assert_ne!(report.app.pid, first_pid);
        assert_eq!(runtime.auto_restart_flag(&id), Some(true));

        runtime.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn logs_capture_stdout() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config());
        let app = make_app(dir.path(), "talker", "echo line-one\necho line-two");
        let id = app.id.clone();

        runtime.register(app).unwrap();
        runtime.start(&id, false).await.unwrap();
        wait_for_status(&runtime, &id, AppStatus::Stopped).await;

        let logs = runtime.logs(&id).await.unwrap();
        let text = String::from_utf8(logs).unwrap();
        assert!(text.contains("line-one"));
        assert!(text.contains("line-two"));
    }

    #[tokio::test]
    async fn missing_app_yields_not_found() {
        let runtime = Runtime::new(test_config());
        assert!(matches!(
            runtime.start("ghost-1.0.0", false).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            runtime.logs("ghost-1.0.0").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(test_config());
        let mut app = make_app(dir.path(), "nobin", "exit 0");
        app.work_dir = PathBuf::from(dir.path().join("nobin"));
        app.manifest.entrypoint = "bin/does-not-exist".into();
        let id = app.id.clone();

        runtime.register(app).unwrap();
        assert!(matches!(
            runtime.start(&id, false).await,
            Err(Error::AppStartFailed(_))
        ));
        assert_eq!(runtime.status(&id).unwrap().app.status, AppStatus::Failed);
    }

    #[tokio::test]
    async fn unhealthy_app_is_auto_restarted() {
        // Reserve a port, then leave it closed so the TCP check fails.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("flaky");
        fs::create_dir_all(work_dir.join("bin")).unwrap();
        let script_path = work_dir.join("bin/run.sh");
        fs::write(&script_path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).unwrap();

        let manifest = Manifest::from_yaml(
            format!(
                "name: flaky\nversion: 1.0.0\nentrypoint: bin/run.sh\n\
                 health_check:\n  type: tcp\n  tcp_port: {port}\n  interval: 50ms\n  timeout: 100ms\n  retries: 2\n"
            )
            .as_bytes(),
        )
        .unwrap();
        let app = Application::from_manifest(manifest, work_dir, None);
        let id = app.id.clone();

        let runtime = Runtime::new(test_config());
        runtime.register(app).unwrap();
        runtime.start(&id, true).await.unwrap();
        let first_pid = runtime.status(&id).unwrap().app.pid;

        // After the failure threshold the supervisor restarts the app.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let report = runtime.status(&id).unwrap();
            if report.app.status == AppStatus::Running
                && report.app.pid != 0
                && report.app.pid != first_pid
            {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "app was never restarted"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // Make the check pass so the restart loop quiesces, then stop. A
        // stop attempt can catch a restart mid-flight, so retry briefly.
        let _listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match runtime.stop(&id).await {
                Ok(()) => break,
                Err(Error::AppNotRunning(_)) => {
                    if runtime.status(&id).unwrap().app.status == AppStatus::Stopped {
                        break;
                    }
                    assert!(tokio::time::Instant::now() < deadline, "never stopped");
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(e) => panic!("unexpected stop error: {e}"),
            }
        }
        assert_eq!(runtime.status(&id).unwrap().app.status, AppStatus::Stopped);
    }

    #[test]
    fn tail_keeps_last_lines() {
        let content = "one\ntwo\nthree\nfour\n";
        assert_eq!(tail_lines(content, 2), "three\nfour");
        assert_eq!(tail_lines(content, 0), content);
        assert_eq!(tail_lines(content, 10), "one\ntwo\nthree\nfour");
        assert_eq!(tail_lines("", 3), "");
    }
}
