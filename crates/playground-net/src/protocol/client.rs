//! Controller-side protocol operations.

use std::path::Path;
use std::time::Duration;

use futures::io::AsyncWriteExt;
use playground_core::package::MAX_PACKAGE_SIZE;
use playground_core::{Application, Error, Result};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::framing::{read_message, write_message};
use super::{
    DeployRequest, DeployResponse, ListAppsResponse, LogsRequest, LogsResponse, CHUNK_SIZE,
    DEPLOY_PROTOCOL, LIST_PROTOCOL, LOGS_PROTOCOL,
};
use crate::host::PeerHost;

/// Caller-side retry policy for transport failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,

    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

/// Run an operation under a retry policy.
///
/// Only transport-level failures are retried; deterministic errors pass
/// straight through.
///
/// # Errors
///
/// Returns the last error once the attempts are exhausted.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(attempt, error = %e, "operation failed, retrying");
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Progress callback: `(bytes_sent, bytes_total)`.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// Deploy a package archive to one peer and return the new app id.
///
/// Streams the archive in 64 KiB chunks after the framed header; progress
/// is reported to `progress` at 10% increments.
///
/// # Errors
///
/// Transport failures, oversize archives and daemon-side rejections (as
/// [`Error::Remote`] carrying the daemon's error code).
pub async fn deploy(
    host: &PeerHost,
    peer_id: &str,
    package: &Path,
    auto_start: bool,
    signature: Option<Vec<u8>>,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<String> {
    let mut file = tokio::fs::File::open(package).await?;
    let file_size = file.metadata().await?.len();
    if file_size > MAX_PACKAGE_SIZE {
        return Err(Error::InvalidInput(format!(
            "package of {file_size} bytes exceeds maximum {MAX_PACKAGE_SIZE}"
        )));
    }

    let file_name = package
        .file_name()
        .ok_or_else(|| Error::InvalidInput("package path has no file name".into()))?
        .to_string_lossy()
        .into_owned();

    let mut stream = host.open_stream(peer_id, DEPLOY_PROTOCOL).await?;
    let request = DeployRequest {
        file_name,
        file_size,
        auto_start,
        signature,
    };
    write_message(&mut stream, &request).await?;

    info!(peer = %peer_id, file = %request.file_name, size = file_size, "sending package");

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    let mut last_percent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream
            .write_all(&buf[..n])
            .await
            .map_err(|_| Error::StreamClosed)?;
        sent += n as u64;

        if let Some(callback) = progress.as_mut() {
            let percent = if file_size == 0 { 100 } else { sent * 100 / file_size };
            if percent / 10 > last_percent / 10 {
                (*callback)(sent, file_size);
                last_percent = percent;
            }
        }
    }
    stream.flush().await.map_err(|_| Error::StreamClosed)?;

    let response: DeployResponse = read_message(&mut stream).await?;
    if response.success {
        response
            .app_id
            .ok_or_else(|| Error::Remote("deploy reply carried no app id".into()))
    } else {
        Err(Error::Remote(
            response.error.unwrap_or_else(|| "Internal".into()),
        ))
    }
}

/// Fetch the application snapshot from one peer.
///
/// # Errors
///
/// Transport failures and daemon-side rejections.
pub async fn list_apps(host: &PeerHost, peer_id: &str) -> Result<Vec<Application>> {
    let mut stream = host.open_stream(peer_id, LIST_PROTOCOL).await?;
    debug!(peer = %peer_id, "requesting application list");

    let response: ListAppsResponse = read_message(&mut stream).await?;
    if response.success {
        Ok(response.apps.unwrap_or_default())
    } else {
        Err(Error::Remote(
            response.error.unwrap_or_else(|| "Internal".into()),
        ))
    }
}

/// Fetch one chunk of an application's logs.
///
/// # Errors
///
/// Transport failures and daemon-side rejections.
pub async fn fetch_logs(
    host: &PeerHost,
    peer_id: &str,
    app_id: &str,
    tail: u64,
) -> Result<String> {
    let mut stream = host.open_stream(peer_id, LOGS_PROTOCOL).await?;
    let request = LogsRequest {
        app_id: app_id.to_string(),
        follow: false,
        tail,
    };
    write_message(&mut stream, &request).await?;

    let response: LogsResponse = read_message(&mut stream).await?;
    if response.success {
        Ok(response.logs.unwrap_or_default())
    } else {
        Err(Error::Remote(
            response.error.unwrap_or_else(|| "Internal".into()),
        ))
    }
}

/// Follow an application's logs: invoke `on_chunk` for the initial reply
/// and every subsequent framed chunk until the daemon closes the stream.
///
/// # Errors
///
/// Transport failures before the first reply and daemon-side rejections; a
/// closed stream after the first reply ends the follow normally.
pub async fn follow_logs<F>(
    host: &PeerHost,
    peer_id: &str,
    app_id: &str,
    tail: u64,
    mut on_chunk: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let mut stream = host.open_stream(peer_id, LOGS_PROTOCOL).await?;
    let request = LogsRequest {
        app_id: app_id.to_string(),
        follow: true,
        tail,
    };
    write_message(&mut stream, &request).await?;

    let first: LogsResponse = read_message(&mut stream).await?;
    if !first.success {
        return Err(Error::Remote(first.error.unwrap_or_else(|| "Internal".into())));
    }
    if let Some(logs) = first.logs {
        on_chunk(&logs);
    }

    loop {
        match read_message::<_, LogsResponse>(&mut stream).await {
            Ok(chunk) => {
                if let Some(logs) = chunk.logs {
                    on_chunk(&logs);
                }
            }
            Err(Error::StreamClosed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
