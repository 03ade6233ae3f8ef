//! russh-backed remote executor

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};

use kw_core::types::StorageInfo;

use super::{parse_df, shell_quote, ExecError, RemoteExecutor, RemoteTarget};
use crate::keystore::KeyMaterial;

/// Executes deploy/probe/stat calls over real SSH sessions
pub struct SshExecutor {
    /// TCP connect + handshake deadline
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Open a session to the target without authenticating
    async fn open(&self, target: &RemoteTarget) -> Result<Handle<HostHandler>, ExecError> {
        let config = Arc::new(Config::default());
        let handler = HostHandler {
            target: target.to_string(),
        };

        tracing::debug!("Connecting to {}", target);
        tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, (target.host.as_str(), target.port), handler),
        )
        .await
        .map_err(|_| ExecError::Timeout)?
        .map_err(|e| ExecError::Unavailable(format!("failed to connect to {}: {}", target, e)))
    }

    /// Open a session and authenticate with the system key
    async fn open_with_key(
        &self,
        key: &KeyMaterial,
        target: &RemoteTarget,
    ) -> Result<Handle<HostHandler>, ExecError> {
        let keypair = to_keypair(key)?;
        let mut session = self.open(target).await?;

        let authenticated = session
            .authenticate_publickey(&target.username, Arc::new(keypair))
            .await
            .map_err(|e| ExecError::Unavailable(format!("authentication error: {}", e)))?;

        if !authenticated {
            close(&session).await;
            return Err(ExecError::AuthFailed(format!(
                "system key rejected by {}",
                target
            )));
        }
        Ok(session)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn deploy(
        &self,
        key: &KeyMaterial,
        target: &RemoteTarget,
        password: &str,
    ) -> Result<(), ExecError> {
        let public_key = key
            .public_openssh()
            .map_err(|e| ExecError::Command(e.to_string()))?;
        let mut session = self.open(target).await?;

        let authenticated = session
            .authenticate_password(&target.username, password)
            .await
            .map_err(|e| ExecError::Unavailable(format!("authentication error: {}", e)))?;
        if !authenticated {
            close(&session).await;
            return Err(ExecError::AuthFailed(format!(
                "password rejected by {}",
                target
            )));
        }

        let result = run_command(&session, &install_script(&public_key)).await;
        close(&session).await;

        let (exit_status, output) = result?;
        if exit_status != 0 {
            return Err(ExecError::Command(format!(
                "authorized_keys update exited with {}: {}",
                exit_status,
                output.trim()
            )));
        }
        tracing::debug!("Installed system key on {}", target);
        Ok(())
    }

    async fn probe(&self, key: &KeyMaterial, target: &RemoteTarget) -> Result<(), ExecError> {
        let session = self.open_with_key(key, target).await?;
        close(&session).await;
        Ok(())
    }

    async fn stat_space(
        &self,
        key: &KeyMaterial,
        target: &RemoteTarget,
    ) -> Result<StorageInfo, ExecError> {
        let session = self.open_with_key(key, target).await?;
        let path = target.default_path.as_deref().unwrap_or(".");
        let command = format!("df -P -B1 {}", shell_quote(path));

        let result = run_command(&session, &command).await;
        close(&session).await;

        let (exit_status, output) = result?;
        if exit_status != 0 {
            return Err(ExecError::Command(format!(
                "df exited with {}: {}",
                exit_status,
                output.trim()
            )));
        }
        let (total, used, available) = parse_df(&output).map_err(ExecError::Command)?;
        Ok(StorageInfo::new(total, used, available))
    }
}

/// Shell script appending `public_key` to `authorized_keys` once
fn install_script(public_key: &str) -> String {
    let quoted = shell_quote(public_key.trim());
    format!(
        "umask 077; mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch ~/.ssh/authorized_keys \
         && chmod 600 ~/.ssh/authorized_keys \
         && (grep -qxF {key} ~/.ssh/authorized_keys || printf '%s\\n' {key} >> ~/.ssh/authorized_keys)",
        key = quoted
    )
}

fn to_keypair(key: &KeyMaterial) -> Result<KeyPair, ExecError> {
    key.with_private_openssh(|pem| russh_keys::decode_secret_key(pem, None))
        .map_err(|e| ExecError::Command(e.to_string()))?
        .map_err(|e| ExecError::Command(format!("failed to load system key: {}", e)))
}

/// Run a command and collect `(exit status, stdout + stderr)`
async fn run_command(
    session: &Handle<HostHandler>,
    command: &str,
) -> Result<(u32, String), ExecError> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| ExecError::Unavailable(format!("failed to open channel: {}", e)))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| ExecError::Unavailable(format!("failed to start command: {}", e)))?;

    let mut output = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, .. } => output.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    let exit_status = exit_status
        .ok_or_else(|| ExecError::Unavailable("channel closed without exit status".into()))?;
    Ok((exit_status, String::from_utf8_lossy(&output).into_owned()))
}

async fn close(session: &Handle<HostHandler>) {
    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        tracing::debug!("Disconnect failed: {}", e);
    }
}

/// Client handler for outbound sessions
///
/// Host keys are accepted and logged; hosts are identified by the
/// operator-entered address and authenticated by our key, not theirs.
struct HostHandler {
    target: String,
}

#[async_trait]
impl client::Handler for HostHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Host key for {}: {}",
            self.target,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_script_quotes_key() {
        let script = install_script("ssh-ed25519 AAAAC3Nz keyward\n");
        assert!(script.contains("grep -qxF 'ssh-ed25519 AAAAC3Nz keyward'"));
        assert!(script.contains(">> ~/.ssh/authorized_keys"));
        assert!(!script.contains("keyward\n"));
    }

    #[test]
    fn test_generated_key_converts_for_russh() {
        let key = KeyMaterial::generate(kw_core::KeyType::Ed25519, 0, "probe").unwrap();
        assert!(to_keypair(&key).is_ok());
    }
}
