//! Wire protocol shared by daemons and controllers.
//!
//! Three independent protocols run over per-request streams. Every frame is
//! `u32 big-endian size || size bytes of UTF-8 JSON`; the deploy request is
//! followed by exactly `file_size` raw body bytes.

pub mod client;
pub mod framing;

use playground_core::Application;
use serde::{Deserialize, Serialize};

/// Protocol id of the deploy exchange.
pub const DEPLOY_PROTOCOL: &str = "/p2p-playground/deploy/1.0.0";

/// Protocol id of the list exchange.
pub const LIST_PROTOCOL: &str = "/p2p-playground/list/1.0.0";

/// Protocol id of the logs exchange.
pub const LOGS_PROTOCOL: &str = "/p2p-playground/logs/1.0.0";

/// Chunk size used when streaming archive bodies.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Header of a deploy request; followed by `file_size` body bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Archive file name (no path separators).
    pub file_name: String,

    /// Exact number of body bytes that follow the header.
    pub file_size: u64,

    /// Start the application right after unpacking.
    pub auto_start: bool,

    /// Detached Ed25519 signature over the archive's SHA-256 digest.
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub signature: Option<Vec<u8>>,
}

/// Reply to a deploy request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResponse {
    /// Whether the deployment succeeded.
    pub success: bool,

    /// Id of the deployed application on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,

    /// Error code on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply to a list request (the request is the bare stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAppsResponse {
    /// Whether the listing succeeded.
    pub success: bool,

    /// Application snapshot on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apps: Option<Vec<Application>>,

    /// Error code on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Header of a logs request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogsRequest {
    /// Application id.
    pub app_id: String,

    /// Keep the stream open and push new chunks as they appear.
    pub follow: bool,

    /// Return at most the last N lines; 0 returns everything.
    pub tail: u64,
}

/// One logs reply chunk. Follow mode sends several until the stream closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogsResponse {
    /// Whether the request succeeded.
    pub success: bool,

    /// Captured bytes, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,

    /// Error code on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_request_roundtrip_with_signature() {
        let request = DeployRequest {
            file_name: "hello-1.0.0.tar.gz".into(),
            file_size: 4096,
            auto_start: true,
            signature: Some(vec![7u8; 64]),
        };
        let json = serde_json::to_string(&request).unwrap();
        // The signature travels as base64 text, not a number array.
        assert!(json.contains("\"signature\":\""));
        let back: DeployRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn deploy_request_omits_absent_signature() {
        let request = DeployRequest {
            file_name: "hello-1.0.0.tar.gz".into(),
            file_size: 0,
            auto_start: false,
            signature: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("signature"));
        let back: DeployRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.signature, None);
    }

    #[test]
    fn responses_omit_empty_fields() {
        let response = DeployResponse {
            success: true,
            app_id: Some("hello-1.0.0".into()),
            error: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("error"));

        let failure: DeployResponse =
            serde_json::from_str(r#"{"success":false,"error":"InvalidSignature"}"#).unwrap();
        assert_eq!(failure.error.as_deref(), Some("InvalidSignature"));
        assert_eq!(failure.app_id, None);
    }
}
