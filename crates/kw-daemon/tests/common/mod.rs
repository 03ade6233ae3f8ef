//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use kw_core::api::DeployRequest;
use kw_core::config::DaemonConfig;
use kw_core::types::{ConnectionFields, StorageInfo};
use kw_daemon::executor::{ExecError, RemoteExecutor, RemoteTarget};
use kw_daemon::keystore::KeyMaterial;
use kw_daemon::LifecycleManager;

/// Remote executor whose outcomes are set by the test
///
/// Every call succeeds unless a failure is scripted for its host.
#[derive(Default)]
pub struct ScriptedExecutor {
    deploy_failures: Mutex<HashMap<String, ExecError>>,
    probe_failures: Mutex<HashMap<String, ExecError>>,
    stat_failures: Mutex<HashMap<String, ExecError>>,
    delay: Mutex<Option<Duration>>,
    storage: Mutex<Option<StorageInfo>>,
    pub deploys: AtomicUsize,
    pub probes: AtomicUsize,
    pub stats: AtomicUsize,
    /// Public keys installed per `user@host:port`
    installed: Mutex<HashMap<String, String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_deploy(&self, host: &str, err: ExecError) {
        self.deploy_failures.lock().unwrap().insert(host.into(), err);
    }

    pub fn fail_probe(&self, host: &str, err: ExecError) {
        self.probe_failures.lock().unwrap().insert(host.into(), err);
    }

    pub fn fail_stat(&self, host: &str, err: ExecError) {
        self.stat_failures.lock().unwrap().insert(host.into(), err);
    }

    /// Remove every scripted failure for `host`
    pub fn heal(&self, host: &str) {
        self.deploy_failures.lock().unwrap().remove(host);
        self.probe_failures.lock().unwrap().remove(host);
        self.stat_failures.lock().unwrap().remove(host);
    }

    /// Make every call sleep before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_storage(&self, info: StorageInfo) {
        *self.storage.lock().unwrap() = Some(info);
    }

    pub fn installed_key(&self, target: &str) -> Option<String> {
        self.installed.lock().unwrap().get(target).cloned()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn scripted(map: &Mutex<HashMap<String, ExecError>>, host: &str) -> Result<(), ExecError> {
        match map.lock().unwrap().get(host) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn deploy(
        &self,
        key: &KeyMaterial,
        target: &RemoteTarget,
        _password: &str,
    ) -> Result<(), ExecError> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Self::scripted(&self.deploy_failures, &target.host)?;
        let public = key.public_openssh().map_err(|e| ExecError::Command(e.to_string()))?;
        self.installed
            .lock()
            .unwrap()
            .insert(target.to_string(), public);
        Ok(())
    }

    async fn probe(&self, _key: &KeyMaterial, target: &RemoteTarget) -> Result<(), ExecError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Self::scripted(&self.probe_failures, &target.host)
    }

    async fn stat_space(
        &self,
        _key: &KeyMaterial,
        target: &RemoteTarget,
    ) -> Result<StorageInfo, ExecError> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Self::scripted(&self.stat_failures, &target.host)?;
        let info = self.storage.lock().unwrap().clone();
        Ok(info.unwrap_or_else(|| StorageInfo::new(1000, 250, 750)))
    }
}

/// Config with short deadlines for tests
pub fn test_config() -> DaemonConfig {
    DaemonConfig {
        connect_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(3),
        auto_refresh_storage: false,
        rsa_bits: 2048,
        ..DaemonConfig::default()
    }
}

/// In-memory manager wired to a scripted executor
pub fn test_manager() -> (Arc<LifecycleManager>, Arc<ScriptedExecutor>) {
    let executor = ScriptedExecutor::new();
    let manager = Arc::new(LifecycleManager::new(test_config(), executor.clone()));
    (manager, executor)
}

pub fn deploy_request(host: &str, username: &str, port: u32) -> DeployRequest {
    DeployRequest {
        key_id: None,
        fields: ConnectionFields::new(host, username, port),
        password: "x".into(),
    }
}
