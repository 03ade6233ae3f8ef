//! Remote executor
//!
//! The capability boundary for everything that talks to a remote host:
//! installing the system key with a password, probing with the key, and
//! reading filesystem capacity. The lifecycle manager only sees the trait.

mod df;
mod ssh;

pub use df::{parse_df, shell_quote};
pub use ssh::SshExecutor;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use kw_core::types::{ConnectionFields, StorageInfo};
use kw_core::KwError;

use crate::keystore::KeyMaterial;

/// Where a remote call goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub use_sftp_mode: bool,
    pub default_path: Option<String>,
}

impl RemoteTarget {
    /// Build a target from validated connection fields
    pub fn from_fields(fields: &ConnectionFields) -> Self {
        Self {
            host: fields.host.clone(),
            username: fields.username.clone(),
            port: u16::try_from(fields.port).unwrap_or(22),
            use_sftp_mode: fields.use_sftp_mode,
            default_path: fields.default_path.clone(),
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Errors reported by a remote executor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// The target rejected the supplied credential
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Connect or transport failure
    #[error("{0}")]
    Unavailable(String),

    /// The call did not finish in time
    #[error("timeout")]
    Timeout,

    /// The remote command ran but failed
    #[error("remote command failed: {0}")]
    Command(String),
}

impl ExecError {
    /// Text recorded as a connection's `error_message` after a failed probe
    pub fn probe_message(&self) -> String {
        self.to_string()
    }

    /// Error for a probe that runs right after a password install
    ///
    /// The password already worked at that point, so a credential failure
    /// means the installed key itself is refused.
    pub fn into_verification_error(self) -> KwError {
        match self {
            ExecError::AuthFailed(msg) => {
                KwError::KeyRejected(format!("key installed but not accepted: {}", msg))
            }
            other => other.into(),
        }
    }
}

impl From<ExecError> for KwError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::AuthFailed(msg) => KwError::AuthFailed(msg),
            ExecError::Unavailable(msg) => KwError::Unavailable(msg),
            ExecError::Timeout => KwError::Timeout,
            ExecError::Command(msg) => {
                KwError::Unavailable(format!("remote command failed: {}", msg))
            }
        }
    }
}

/// Performs network I/O against remote hosts
///
/// Implementations must be all-or-nothing per call: a failed `deploy`
/// leaves no partially written `authorized_keys` entry behind.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Install the public half of `key` using password authentication
    async fn deploy(
        &self,
        key: &KeyMaterial,
        target: &RemoteTarget,
        password: &str,
    ) -> Result<(), ExecError>;

    /// Check that `key` authenticates against the target
    async fn probe(&self, key: &KeyMaterial, target: &RemoteTarget) -> Result<(), ExecError>;

    /// Read capacity of the target's default path
    async fn stat_space(
        &self,
        key: &KeyMaterial,
        target: &RemoteTarget,
    ) -> Result<StorageInfo, ExecError>;
}

/// Run an executor call under a deadline; expiry is `ExecError::Timeout`
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, ExecError>
where
    F: Future<Output = Result<T, ExecError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_display() {
        let target = RemoteTarget::from_fields(&ConnectionFields::new("10.0.0.5", "root", 2222));
        assert_eq!(target.to_string(), "root@10.0.0.5:2222");
        assert!(target.use_sftp_mode);
    }

    #[test]
    fn test_exec_error_conversion() {
        assert_eq!(
            KwError::from(ExecError::AuthFailed("password rejected".into())),
            KwError::AuthFailed("password rejected".into())
        );
        assert_eq!(KwError::from(ExecError::Timeout), KwError::Timeout);
        assert!(matches!(
            KwError::from(ExecError::Command("exit 1".into())),
            KwError::Unavailable(_)
        ));
        assert_eq!(ExecError::Timeout.probe_message(), "timeout");
    }

    #[test]
    fn test_verification_error_keeps_password_failures_apart() {
        let err = ExecError::AuthFailed("publickey".into()).into_verification_error();
        assert!(matches!(err, KwError::KeyRejected(_)));
        assert_eq!(
            ExecError::Timeout.into_verification_error(),
            KwError::Timeout
        );
        assert!(matches!(
            ExecError::Unavailable("reset".into()).into_verification_error(),
            KwError::Unavailable(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_is_timeout() {
        let result: Result<(), ExecError> = with_deadline(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(ExecError::Timeout));
    }
}
