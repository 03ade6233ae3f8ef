//! Core domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::KwError;
use crate::format::format_bytes;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Get the raw numeric value
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a system key generation
    ///
    /// Ids are never reused, so a connection that still carries an old id
    /// can never be mistaken for one deployed with a newer key.
    KeyId
);
numeric_id!(
    /// Identifier of a registered connection
    ConnectionId
);
numeric_id!(
    /// Identifier of a repository reference
    RepositoryId
);

/// Supported system key algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ed25519,
    Rsa,
    Ecdsa,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Ed25519 => "ed25519",
            KeyType::Rsa => "rsa",
            KeyType::Ecdsa => "ecdsa",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = KwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ed25519" => Ok(KeyType::Ed25519),
            "rsa" => Ok(KeyType::Rsa),
            "ecdsa" => Ok(KeyType::Ecdsa),
            other => Err(KwError::InvalidArgument(format!(
                "unsupported key type '{}' (expected ed25519, rsa or ecdsa)",
                other
            ))),
        }
    }
}

/// Reachability status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Never probed
    #[default]
    Untested,
    /// Last probe succeeded with the referenced key
    Connected,
    /// Last probe failed, or the referenced key was removed
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Untested => write!(f, "untested"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Public projection of the system key
///
/// Private material never appears here; it stays inside the key store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSshKey {
    pub id: KeyId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub key_type: KeyType,
    pub fingerprint: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

/// Capacity snapshot of a connection's remote filesystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub total: u64,
    pub total_formatted: String,
    pub used: u64,
    pub used_formatted: String,
    pub available: u64,
    pub available_formatted: String,
    pub percent_used: f64,
    pub last_check: DateTime<Utc>,
}

impl StorageInfo {
    /// Build a snapshot from raw byte counts, stamped now
    pub fn new(total: u64, used: u64, available: u64) -> Self {
        Self::at(total, used, available, Utc::now())
    }

    /// Build a snapshot with an explicit check time
    pub fn at(total: u64, used: u64, available: u64, last_check: DateTime<Utc>) -> Self {
        let percent_used = if total == 0 {
            0.0
        } else {
            ((used as f64 / total as f64) * 1000.0).round() / 10.0
        };
        Self {
            total,
            total_formatted: format_bytes(total),
            used,
            used_formatted: format_bytes(used),
            available,
            available_formatted: format_bytes(available),
            percent_used,
            last_check,
        }
    }
}

/// Editable connection parameters
///
/// Used by deploy, manual test and update. `password` is deliberately not
/// part of this type so it can never be persisted with a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFields {
    pub host: String,
    pub username: String,
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default = "default_sftp_mode")]
    pub use_sftp_mode: bool,
    #[serde(default)]
    pub default_path: Option<String>,
    #[serde(default)]
    pub mount_point: Option<String>,
}

fn default_port() -> u32 {
    22
}

fn default_sftp_mode() -> bool {
    true
}

impl ConnectionFields {
    /// Minimal fields for a host/user/port triple
    pub fn new(host: impl Into<String>, username: impl Into<String>, port: u32) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            port,
            use_sftp_mode: true,
            default_path: None,
            mount_point: None,
        }
    }

    /// Validate and normalize the fields
    ///
    /// Host and username are trimmed; empty optional strings become `None`.
    pub fn normalized(mut self) -> Result<Self, KwError> {
        self.host = self.host.trim().to_string();
        self.username = self.username.trim().to_string();
        if self.host.is_empty() {
            return Err(KwError::InvalidArgument("host must not be empty".into()));
        }
        if self.username.is_empty() {
            return Err(KwError::InvalidArgument(
                "username must not be empty".into(),
            ));
        }
        if self.port == 0 || self.port > u16::MAX as u32 {
            return Err(KwError::InvalidArgument(format!(
                "port {} out of range (1-65535)",
                self.port
            )));
        }
        self.default_path = non_empty(self.default_path);
        self.mount_point = non_empty(self.mount_point);
        Ok(self)
    }

    /// Whether these fields address the given triple
    pub fn matches(&self, host: &str, username: &str, port: u32) -> bool {
        self.host == host && self.username == username && self.port == port
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// A registered remote host binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshConnection {
    pub id: ConnectionId,
    /// Weak reference to the key that authenticates this connection
    pub ssh_key_id: Option<KeyId>,
    #[serde(flatten)]
    pub fields: ConnectionFields,
    pub status: ConnectionStatus,
    pub last_test: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub storage: Option<StorageInfo>,
    pub created_at: DateTime<Utc>,
}

impl SshConnection {
    pub fn host(&self) -> &str {
        &self.fields.host
    }

    pub fn username(&self) -> &str {
        &self.fields.username
    }

    pub fn port(&self) -> u32 {
        self.fields.port
    }
}

/// A backup repository that authenticates with the system key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub id: RepositoryId,
    pub name: String,
    pub path: String,
    pub ssh_key_id: Option<KeyId>,
    pub connection_id: Option<ConnectionId>,
    pub created_at: DateTime<Utc>,
}
