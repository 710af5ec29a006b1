//! Thin systemd glue for installing and driving the daemon as a service.

use std::path::Path;
use std::process::Command;

use playground_core::{Error, Result};

const SERVICE_NAME: &str = "playground-daemon";
const UNIT_PATH: &str = "/etc/systemd/system/playground-daemon.service";

/// Write the unit file, reload systemd and enable the service.
///
/// # Errors
///
/// Fails when the unit file cannot be written or `systemctl` fails.
pub fn install(config: Option<&Path>) -> Result<()> {
    let exe = std::env::current_exe()?;
    let exec_start = match config {
        Some(path) => format!("{} run --config {}", exe.display(), path.display()),
        None => format!("{} run", exe.display()),
    };

    let unit = format!(
        "[Unit]\n\
         Description=p2p-playground daemon\n\
         After=network.target\n\
         \n\
         [Service]\n\
         ExecStart={exec_start}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    );
    std::fs::write(UNIT_PATH, unit)?;

    systemctl(&["daemon-reload"])?;
    systemctl(&["enable", SERVICE_NAME])?;
    println!("installed {UNIT_PATH}");
    Ok(())
}

/// Disable the service and remove the unit file.
///
/// # Errors
///
/// Fails when `systemctl` fails or the unit file cannot be removed.
pub fn uninstall() -> Result<()> {
    systemctl(&["disable", "--now", SERVICE_NAME])?;
    std::fs::remove_file(UNIT_PATH)?;
    systemctl(&["daemon-reload"])?;
    println!("removed {UNIT_PATH}");
    Ok(())
}

/// Start the service.
///
/// # Errors
///
/// Fails when `systemctl` fails.
pub fn start() -> Result<()> {
    systemctl(&["start", SERVICE_NAME])
}

/// Stop the service.
///
/// # Errors
///
/// Fails when `systemctl` fails.
pub fn stop() -> Result<()> {
    systemctl(&["stop", SERVICE_NAME])
}

/// Restart the service.
///
/// # Errors
///
/// Fails when `systemctl` fails.
pub fn restart() -> Result<()> {
    systemctl(&["restart", SERVICE_NAME])
}

/// Print the service status. A non-zero status exit (service stopped) is
/// not an error.
///
/// # Errors
///
/// Fails when `systemctl` cannot be spawned.
pub fn status() -> Result<()> {
    let output = Command::new("systemctl")
        .args(["status", "--no-pager", SERVICE_NAME])
        .output()?;
    print!("{}", String::from_utf8_lossy(&output.stdout));
    eprint!("{}", String::from_utf8_lossy(&output.stderr));
    Ok(())
}

fn systemctl(args: &[&str]) -> Result<()> {
    let status = Command::new("systemctl").args(args).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "systemctl {} exited with {status}",
            args.join(" ")
        )))
    }
}
