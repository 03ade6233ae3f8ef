//! HTTP API payloads
//!
//! JSON request and response bodies exchanged between the daemon and its
//! clients. Field names follow the wire contract, not Rust conventions.

use serde::{Deserialize, Serialize};

use crate::error::KwError;
use crate::types::{
    ConnectionFields, ConnectionId, ConnectionStatus, KeyId, SshConnection, StorageInfo,
    SystemSshKey,
};

/// Default name given to a generated or imported system key
pub const DEFAULT_KEY_NAME: &str = "System SSH Key";

/// Body of `POST /system-key/generate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateKeyRequest {
    pub key_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Body of `POST /system-key/import`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportKeyRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub private_key_path: String,
    #[serde(default)]
    pub public_key_path: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Response of `GET /system-key`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemKeyResponse {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<SystemSshKey>,
}

/// Response of `DELETE /system-key/{id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDeletedResponse {
    pub connections_marked_failed: usize,
    pub repositories_cleared: usize,
}

/// Response of `GET /system-key/impact`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyImpact {
    pub connections: usize,
    pub repositories: usize,
}

/// Body of `POST /connections/deploy`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub key_id: Option<KeyId>,
    #[serde(flatten)]
    pub fields: ConnectionFields,
    pub password: String,
}

/// Body of `POST /connections/test`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConnectionRequest {
    #[serde(default)]
    pub key_id: Option<KeyId>,
    #[serde(flatten)]
    pub fields: ConnectionFields,
}

/// Response of `POST /connections/test`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConnectionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<SshConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `POST /connections/{id}/test`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestExistingResponse {
    pub success: bool,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Body of `POST /connections/{id}/redeploy`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeployRequest {
    pub password: String,
}

/// Response of `POST /connections/{id}/redeploy`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeployResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<SshConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Response of `POST /connections/{id}/refresh-storage`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshStorageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of `POST /connections/refresh-storage`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScheduledResponse {
    pub scheduled: usize,
}

/// A connection as listed to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionView {
    #[serde(flatten)]
    pub connection: SshConnection,
    pub ssh_key_name: Option<String>,
}

/// Response of `GET /connections/stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
    pub failed: usize,
    pub untested: usize,
}

impl ConnectionStats {
    /// Tally statuses over a set of connections
    pub fn from_connections<'a>(connections: impl IntoIterator<Item = &'a SshConnection>) -> Self {
        let mut stats = Self::default();
        for conn in connections {
            stats.total += 1;
            match conn.status {
                ConnectionStatus::Connected => stats.connected += 1,
                ConnectionStatus::Failed => stats.failed += 1,
                ConnectionStatus::Untested => stats.untested += 1,
            }
        }
        stats
    }
}

/// Response of `GET /connections/{id}/impact`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionImpact {
    pub connection_id: ConnectionId,
    pub repositories: usize,
}

/// Body of `POST /repositories`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
}

/// Error body returned with every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub success: bool,
    pub code: String,
    pub detail: String,
}

impl From<&KwError> for ApiError {
    fn from(err: &KwError) -> Self {
        Self {
            success: false,
            code: err.code().to_string(),
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_request_flattens_fields() {
        let json = r#"{"key_id":3,"host":"10.0.0.5","username":"root","port":22,"password":"x"}"#;
        let req: DeployRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.key_id, Some(KeyId(3)));
        assert_eq!(req.fields.host, "10.0.0.5");
        assert!(req.fields.use_sftp_mode);
        assert_eq!(req.password, "x");
    }

    #[test]
    fn test_test_request_defaults_port() {
        let json = r#"{"host":"nas","username":"backup"}"#;
        let req: TestConnectionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.fields.port, 22);
        assert_eq!(req.key_id, None);
    }

    #[test]
    fn test_missing_key_omitted() {
        let resp = SystemKeyResponse {
            exists: false,
            key: None,
        };
        assert_eq!(serde_json::to_string(&resp).unwrap(), r#"{"exists":false}"#);
    }

    #[test]
    fn test_api_error_from_kw_error() {
        let body = ApiError::from(&KwError::AuthFailed("password rejected".into()));
        assert!(!body.success);
        assert_eq!(body.code, "auth_failed");
        assert!(body.detail.contains("password rejected"));
    }
}
