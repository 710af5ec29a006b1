//! Error taxonomy shared by every component.
//!
//! Errors that cross the wire are reduced to their [`Error::code`] so a
//! remote caller sees a stable identifier (`InvalidSignature`,
//! `PackageNotSigned`, ...) while the local log line keeps the full context.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by the core, the peer fabric and the daemon handlers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A resource (app id, peer id, key file, log file) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A resource with the same identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed caller input (multiaddr, hex, oversize file, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The peer was rejected by the trust gate or the PSK layer.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Signature verification failed against every trusted key.
    #[error("invalid signature")]
    InvalidSignature,

    /// The daemon requires signed packages and none was provided.
    #[error("package not signed")]
    PackageNotSigned,

    /// The manifest is missing or fails validation.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The archive is corrupt or otherwise unusable.
    #[error("invalid package: {0}")]
    InvalidPackage(String),

    /// A checksum did not match the expected digest.
    #[error("invalid checksum")]
    InvalidChecksum,

    /// The application is not running.
    #[error("application not running: {0}")]
    AppNotRunning(String),

    /// The application is already running.
    #[error("application already running: {0}")]
    AppAlreadyRunning(String),

    /// The application process could not be spawned.
    #[error("application start failed: {0}")]
    AppStartFailed(String),

    /// The application failed its health checks.
    #[error("application unhealthy: {0}")]
    AppUnhealthy(String),

    /// A connection attempt failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The stream was closed by the remote side.
    #[error("stream closed")]
    StreamClosed,

    /// The remote peer does not speak the requested protocol.
    #[error("protocol not supported: {0}")]
    ProtocolNotSupported(String),

    /// A deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation was canceled by its caller.
    #[error("canceled")]
    Canceled,

    /// An error reported by the remote end of a protocol stream.
    #[error("remote error: {0}")]
    Remote(String),

    /// Unexpected host error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (wire message) failure.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (manifest, config) failure.
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Stable identifier used in protocol replies and structured logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Unauthorized(_) => "Unauthorized",
            Self::InvalidSignature => "InvalidSignature",
            Self::PackageNotSigned => "PackageNotSigned",
            Self::InvalidManifest(_) => "InvalidManifest",
            Self::InvalidPackage(_) => "InvalidPackage",
            Self::InvalidChecksum => "InvalidChecksum",
            Self::AppNotRunning(_) => "AppNotRunning",
            Self::AppAlreadyRunning(_) => "AppAlreadyRunning",
            Self::AppStartFailed(_) => "AppStartFailed",
            Self::AppUnhealthy(_) => "AppUnhealthy",
            Self::ConnectionFailed(_) => "ConnectionFailed",
            Self::StreamClosed => "StreamClosed",
            Self::ProtocolNotSupported(_) => "ProtocolNotSupported",
            Self::Timeout(_) => "Timeout",
            Self::Canceled => "Canceled",
            Self::Remote(_) => "Remote",
            Self::Internal(_) => "Internal",
            Self::Io(_) => "Io",
            Self::Json(_) | Self::Yaml(_) => "InvalidInput",
        }
    }

    /// Whether a caller's retry policy may retry the failed operation.
    ///
    /// Only transport-level failures are retryable; everything else is
    /// deterministic and retrying would not help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::StreamClosed | Self::Timeout(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable() {
        assert_eq!(Error::PackageNotSigned.code(), "PackageNotSigned");
        assert_eq!(Error::InvalidSignature.code(), "InvalidSignature");
        assert_eq!(Error::AppNotRunning("x".into()).code(), "AppNotRunning");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::StreamClosed.is_transient());
        assert!(Error::ConnectionFailed("dial".into()).is_transient());
        assert!(!Error::InvalidSignature.is_transient());
        assert!(!Error::AppAlreadyRunning("x".into()).is_transient());
    }
}
