//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the keyward daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the HTTP API binds to
    pub bind_address: String,

    /// Directory holding the state file and key material
    pub data_dir: PathBuf,

    /// TCP/SSH handshake deadline for remote calls
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Deadline for the remote command run after authentication
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// How often the background sweep looks for connections without storage data
    #[serde(with = "duration_secs")]
    pub storage_refresh_interval: Duration,

    /// Whether the background storage sweep runs at all
    pub auto_refresh_storage: bool,

    /// Modulus size for generated RSA keys
    pub rsa_bits: usize,

    /// Comment embedded in generated public keys
    pub key_comment: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8086".to_string(),
            data_dir: super::default_data_dir(),
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            storage_refresh_interval: Duration::from_secs(30),
            auto_refresh_storage: true,
            rsa_bits: 4096,
            key_comment: "keyward".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Overall deadline for a single remote executor call
    pub fn remote_deadline(&self) -> Duration {
        self.connect_timeout + self.command_timeout
    }

    /// Path of the persisted state file
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// Directory holding private key material
    pub fn key_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_short_timeouts() {
        let config = DaemonConfig::default();
        assert!(config.connect_timeout >= Duration::from_secs(10));
        assert!(config.connect_timeout <= Duration::from_secs(30));
        assert_eq!(config.remote_deadline(), Duration::from_secs(45));
    }

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = DaemonConfig {
            data_dir: PathBuf::from("/var/lib/keyward"),
            ..DaemonConfig::default()
        };
        assert_eq!(config.state_path(), PathBuf::from("/var/lib/keyward/state.json"));
        assert_eq!(config.key_dir(), PathBuf::from("/var/lib/keyward/keys"));
    }
}
