//! Lifecycle manager
//!
//! Orchestrates the key store, the registries and the remote executor.
//!
//! # Locking model
//!
//! The key store sits behind a `RwLock` that doubles as the coordination
//! lock for everything that reads `ssh_key_id` validity:
//!
//! - Generate, import and delete take the write lock. Delete runs its
//!   cascade over connections and repositories while still holding it, so
//!   no reader ever sees a removed key with dependents still pointing at it.
//! - Deploy, redeploy, tests, refresh and update take the read lock and keep
//!   it across their remote calls, so a key cannot be erased underneath an
//!   in-flight deploy.
//!
//! Operations on one connection additionally take that connection's mutex
//! (always after the key lock). Different connections proceed in parallel.

mod locks;
mod refresher;

pub use locks::{ConnectionLocks, InFlight, InFlightClaim};
pub use refresher::run_storage_refresher;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use kw_core::api::{
    ConnectionImpact, ConnectionStats, ConnectionView, CreateRepositoryRequest, DeployRequest,
    KeyDeletedResponse, KeyImpact, RefreshStorageResponse, TestConnectionRequest,
    TestConnectionResponse, DEFAULT_KEY_NAME,
};
use kw_core::config::DaemonConfig;
use kw_core::types::{ConnectionFields, RepositoryRef, SshConnection, SystemSshKey};
use kw_core::{ConnectionId, KeyId, KeyType, KwError, RepositoryId};

use crate::executor::{with_deadline, ExecError, RemoteExecutor, RemoteTarget};
use crate::keystore::{ActiveKey, KeyMaterial, KeyStore};
use crate::persist::{StateFile, StateSnapshot};
use crate::registry::{ConnectionRegistry, NewConnection, RepositoryRegistry, StatusChange};

/// Error message recorded on connections whose key was deleted
pub const KEY_REMOVED_MESSAGE: &str = "system key was removed";

/// Error message recorded when a connection has no usable key reference
pub const NO_KEY_MESSAGE: &str = "no system key is deployed to this connection; redeploy it";

/// Owner of all key and connection state
pub struct LifecycleManager {
    config: DaemonConfig,
    keys: RwLock<KeyStore>,
    connections: ConnectionRegistry,
    repositories: RepositoryRegistry,
    executor: Arc<dyn RemoteExecutor>,
    locks: ConnectionLocks,
    in_flight: Arc<InFlight>,
    state_file: Option<StateFile>,
}

impl LifecycleManager {
    /// Create a manager that keeps everything in memory
    pub fn new(config: DaemonConfig, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            config,
            keys: RwLock::new(KeyStore::in_memory()),
            connections: ConnectionRegistry::new(),
            repositories: RepositoryRegistry::new(),
            executor,
            locks: ConnectionLocks::new(),
            in_flight: Arc::new(InFlight::new()),
            state_file: None,
        }
    }

    /// Open the persistent state under `config.data_dir`
    ///
    /// A recorded key whose material cannot be reloaded is dropped, and its
    /// dependents cascade exactly as if it had been deleted.
    pub fn open(config: DaemonConfig, executor: Arc<dyn RemoteExecutor>) -> Result<Self, KwError> {
        let state_file = StateFile::new(config.state_path());
        let snapshot = state_file.load()?.unwrap_or_default();

        let (keys, dropped) = KeyStore::restore(
            Some(config.key_dir()),
            snapshot.system_key,
            snapshot.next_key_id,
        );
        let connections =
            ConnectionRegistry::restore(snapshot.connections, snapshot.next_connection_id);
        let repositories =
            RepositoryRegistry::restore(snapshot.repositories, snapshot.next_repository_id);

        if let Some(dropped) = &dropped {
            let marked = connections.revoke_key(dropped.id, KEY_REMOVED_MESSAGE, Utc::now());
            let cleared = repositories.clear_key(dropped.id);
            tracing::warn!(
                "System key {} could not be restored; {} connections marked failed, {} repositories cleared",
                dropped.id,
                marked,
                cleared
            );
        }

        tracing::info!(
            "Loaded state from {:?}: key={}, {} connections, {} repositories",
            state_file.path(),
            keys.current().is_some(),
            connections.len(),
            repositories.len()
        );

        if dropped.is_some() {
            state_file.save_blocking(|| self::snapshot(&keys, &connections, &repositories))?;
        }

        Ok(Self {
            config,
            keys: RwLock::new(keys),
            connections,
            repositories,
            executor,
            locks: ConnectionLocks::new(),
            in_flight: Arc::new(InFlight::new()),
            state_file: Some(state_file),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    // ---- key store --------------------------------------------------------

    /// Public projection of the system key, if one exists
    pub async fn system_key(&self) -> Option<SystemSshKey> {
        self.keys.read().await.current().cloned()
    }

    /// Generate a fresh system key
    pub async fn generate_key(
        &self,
        key_type: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<SystemSshKey, KwError> {
        let key_type: KeyType = key_type.parse()?;

        let mut keys = self.keys.write().await;
        keys.ensure_vacant()?;

        let bits = self.config.rsa_bits;
        let comment = self.config.key_comment.clone();
        let material =
            tokio::task::spawn_blocking(move || KeyMaterial::generate(key_type, bits, &comment))
                .await
                .map_err(|e| KwError::Internal(format!("key generation task failed: {}", e)))??;

        let record = keys.install(material, key_name(name), non_blank(description))?;
        if let Err(e) = self.persist(&keys).await {
            discard_unsaved_key(&mut keys, record.id);
            return Err(e);
        }

        tracing::info!(
            "Generated system key {} ({}, {})",
            record.id,
            record.key_type,
            record.fingerprint
        );
        Ok(record)
    }

    /// Import an existing keypair from disk
    pub async fn import_key(
        &self,
        private_key_path: &Path,
        public_key_path: Option<&Path>,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<SystemSshKey, KwError> {
        let mut keys = self.keys.write().await;
        keys.ensure_vacant()?;

        let material = KeyMaterial::import_files(private_key_path, public_key_path)?;
        let record = keys.install(material, key_name(name), non_blank(description))?;
        if let Err(e) = self.persist(&keys).await {
            discard_unsaved_key(&mut keys, record.id);
            return Err(e);
        }

        tracing::info!(
            "Imported system key {} from {:?} ({}, {})",
            record.id,
            private_key_path,
            record.key_type,
            record.fingerprint
        );
        Ok(record)
    }

    /// Delete the system key and revoke it from every dependent
    ///
    /// The material is already erased when the state write runs. If that
    /// write fails the error is returned, and the next start drops the
    /// recorded key the same way because its material is gone.
    pub async fn delete_key(&self, id: KeyId) -> Result<KeyDeletedResponse, KwError> {
        let mut keys = self.keys.write().await;
        let removed = keys.remove(id)?;

        let connections_marked_failed =
            self.connections
                .revoke_key(removed.id, KEY_REMOVED_MESSAGE, Utc::now());
        let repositories_cleared = self.repositories.clear_key(removed.id);
        self.persist(&keys).await?;

        tracing::info!(
            "Deleted system key {}; {} connections marked failed, {} repositories cleared",
            removed.id,
            connections_marked_failed,
            repositories_cleared
        );
        Ok(KeyDeletedResponse {
            connections_marked_failed,
            repositories_cleared,
        })
    }

    /// Dependents that deleting the current key would affect
    pub async fn key_impact(&self) -> Result<KeyImpact, KwError> {
        let keys = self.keys.read().await;
        let key = keys
            .current()
            .ok_or_else(|| KwError::NotFound("no system key exists".into()))?;
        Ok(KeyImpact {
            connections: self.connections.count_for_key(key.id),
            repositories: self.repositories.count_for_key(key.id),
        })
    }

    // ---- deploy and tests -------------------------------------------------

    /// Install the system key on a host with a password, then verify it
    ///
    /// No row is written unless both the install and the probe succeed.
    pub async fn deploy(&self, req: DeployRequest) -> Result<SshConnection, KwError> {
        let fields = req.fields.normalized()?;
        let keys = self.keys.read().await;
        let key = current_key(&keys, req.key_id)?;

        let target = RemoteTarget::from_fields(&fields);
        let existing = self.registered(&fields);
        let _guard = match existing {
            Some(id) => Some(self.locks.lock(id).await),
            None => None,
        };

        if let Err(e) = self.install_and_verify(&key, &target, &req.password).await {
            tracing::warn!("Deploy to {} failed: {}", target, e);
            return Err(e);
        }

        let conn = self.connections.upsert(NewConnection {
            fields,
            ssh_key_id: Some(key.id()),
            initial: Some(StatusChange::connected(Utc::now())),
        })?;
        self.persist_row(&keys, existing.is_none().then_some(conn.id))
            .await?;

        tracing::info!(
            "Deployed system key {} to {} (connection {})",
            key.id(),
            target,
            conn.id
        );
        Ok(conn)
    }

    /// Probe a target with the system key, registering it only on success
    pub async fn test_manual(
        &self,
        req: TestConnectionRequest,
    ) -> Result<TestConnectionResponse, KwError> {
        let fields = req.fields.normalized()?;
        let keys = self.keys.read().await;
        let key = current_key(&keys, req.key_id)?;

        let target = RemoteTarget::from_fields(&fields);
        let existing = self.registered(&fields);
        let _guard = match existing {
            Some(id) => Some(self.locks.lock(id).await),
            None => None,
        };

        if let Err(e) = self.remote(self.executor.probe(&key.material, &target)).await {
            tracing::warn!("Manual test of {} failed: {}", target, e);
            return Ok(TestConnectionResponse {
                success: false,
                connection: None,
                error: Some(e.probe_message()),
            });
        }

        let conn = self.connections.upsert(NewConnection {
            fields,
            ssh_key_id: Some(key.id()),
            initial: Some(StatusChange::connected(Utc::now())),
        })?;
        self.persist_row(&keys, existing.is_none().then_some(conn.id))
            .await?;

        tracing::info!("Manual test of {} succeeded (connection {})", target, conn.id);
        Ok(TestConnectionResponse {
            success: true,
            connection: Some(conn),
            error: None,
        })
    }

    /// Re-install the current key on a registered connection
    ///
    /// On failure the row is left exactly as it was.
    pub async fn redeploy(
        &self,
        id: ConnectionId,
        password: &str,
    ) -> Result<SshConnection, KwError> {
        let keys = self.keys.read().await;
        self.connections.require(id)?;
        let key = keys.require()?;

        let _guard = self.locks.lock(id).await;
        let conn = self.connections.require(id)?;
        let target = RemoteTarget::from_fields(&conn.fields);

        if let Err(e) = self.install_and_verify(&key, &target, password).await {
            tracing::warn!("Redeploy of connection {} failed: {}", id, e);
            return Err(e);
        }

        self.connections.set_key(id, Some(key.id()))?;
        let conn = self
            .connections
            .set_status(id, StatusChange::connected(Utc::now()))?;
        self.persist(&keys).await?;

        tracing::info!("Redeployed system key {} to connection {}", key.id(), id);
        Ok(conn)
    }

    /// Re-probe a registered connection with its key
    ///
    /// Probe failures are recorded on the row; only structural errors
    /// surface as `Err`.
    pub async fn test_existing(&self, id: ConnectionId) -> Result<SshConnection, KwError> {
        let keys = self.keys.read().await;
        self.connections.require(id)?;

        let _guard = self.locks.lock(id).await;
        let conn = self.connections.require(id)?;
        let conn = self.probe_locked(&keys, conn).await?;
        self.persist(&keys).await?;
        Ok(conn)
    }

    /// Probe `conn` and record the outcome; caller holds its lock
    async fn probe_locked(
        &self,
        keys: &KeyStore,
        conn: SshConnection,
    ) -> Result<SshConnection, KwError> {
        let change = match usable_key(keys, &conn) {
            Some(key) => {
                let target = RemoteTarget::from_fields(&conn.fields);
                match self.remote(self.executor.probe(&key.material, &target)).await {
                    Ok(()) => StatusChange::connected(Utc::now()),
                    Err(e) => {
                        tracing::warn!("Probe of connection {} ({}) failed: {}", conn.id, target, e);
                        StatusChange::failed(e.probe_message(), Utc::now())
                    }
                }
            }
            None => StatusChange::failed(NO_KEY_MESSAGE, Utc::now()),
        };

        let updated = self.connections.set_status(conn.id, change)?;
        tracing::debug!("Connection {} is now {}", updated.id, updated.status);
        Ok(updated)
    }

    /// Query remote capacity and attach it to the connection
    ///
    /// Never touches status. A failed query leaves the previous snapshot in
    /// place and is reported in the response body, not as `Err`.
    pub async fn refresh_storage(
        &self,
        id: ConnectionId,
    ) -> Result<RefreshStorageResponse, KwError> {
        let keys = self.keys.read().await;
        self.connections.require(id)?;

        let _guard = self.locks.lock(id).await;
        let conn = self.connections.require(id)?;
        let key = usable_key(&keys, &conn).ok_or_else(|| {
            KwError::Precondition(format!("connection {}: {}", id, NO_KEY_MESSAGE))
        })?;

        let target = RemoteTarget::from_fields(&conn.fields);
        match self
            .remote(self.executor.stat_space(&key.material, &target))
            .await
        {
            Ok(info) => {
                self.connections.attach_storage(id, info.clone())?;
                self.persist(&keys).await?;
                tracing::debug!(
                    "Storage of connection {}: {} of {} used",
                    id,
                    info.used_formatted,
                    info.total_formatted
                );
                Ok(RefreshStorageResponse {
                    success: true,
                    storage: Some(info),
                    error: None,
                })
            }
            Err(e) => {
                tracing::debug!("Storage refresh of connection {} failed: {}", id, e);
                Ok(RefreshStorageResponse {
                    success: false,
                    storage: conn.storage,
                    error: Some(e.probe_message()),
                })
            }
        }
    }

    // ---- connection CRUD --------------------------------------------------

    /// Edit connection metadata, then re-probe it
    ///
    /// The edit stays committed even when the follow-up probe fails.
    pub async fn update_connection(
        &self,
        id: ConnectionId,
        fields: ConnectionFields,
    ) -> Result<SshConnection, KwError> {
        let keys = self.keys.read().await;
        self.connections.require(id)?;

        let _guard = self.locks.lock(id).await;
        let updated = self.connections.update_fields(id, fields)?;
        self.persist(&keys).await?;
        tracing::info!(
            "Updated connection {} ({}@{}:{})",
            id,
            updated.username(),
            updated.host(),
            updated.port()
        );

        let conn = self.probe_locked(&keys, updated).await?;
        self.persist(&keys).await?;
        Ok(conn)
    }

    /// Remove a connection and detach repositories from it
    pub async fn delete_connection(&self, id: ConnectionId) -> Result<usize, KwError> {
        let keys = self.keys.read().await;
        self.connections.require(id)?;

        let guard = self.locks.lock(id).await;
        self.connections.delete(id)?;
        let cleared = self.repositories.clear_connection(id);
        drop(guard);
        self.locks.forget(id);
        self.persist(&keys).await?;

        tracing::info!(
            "Deleted connection {}; {} repositories detached",
            id,
            cleared
        );
        Ok(cleared)
    }

    /// Dependents that deleting a connection would affect
    pub fn connection_impact(&self, id: ConnectionId) -> Result<ConnectionImpact, KwError> {
        self.connections.require(id)?;
        Ok(ConnectionImpact {
            connection_id: id,
            repositories: self.repositories.count_for_connection(id),
        })
    }

    pub fn connection(&self, id: ConnectionId) -> Result<SshConnection, KwError> {
        self.connections.require(id)
    }

    /// All connections with the name of the key that authenticates them
    pub async fn list_connections(&self) -> Vec<ConnectionView> {
        let keys = self.keys.read().await;
        let current = keys.current();
        self.connections
            .list()
            .into_iter()
            .map(|connection| {
                let ssh_key_name = current
                    .filter(|k| connection.ssh_key_id == Some(k.id))
                    .map(|k| k.name.clone());
                ConnectionView {
                    connection,
                    ssh_key_name,
                }
            })
            .collect()
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        let _keys = self.keys.read().await;
        ConnectionStats::from_connections(&self.connections.list())
    }

    // ---- repositories -----------------------------------------------------

    /// Register a repository bound to the current key
    ///
    /// A referenced connection is locked while the row is inserted, so a
    /// concurrent connection delete either sees the repository or wins and
    /// makes this call fail with `NotFound`.
    pub async fn create_repository(
        &self,
        req: CreateRepositoryRequest,
    ) -> Result<RepositoryRef, KwError> {
        let keys = self.keys.read().await;
        let _guard = match req.connection_id {
            Some(conn) => {
                self.connections.require(conn)?;
                let guard = self.locks.lock(conn).await;
                if let Err(e) = self.connections.require(conn) {
                    drop(guard);
                    self.locks.forget(conn);
                    return Err(e);
                }
                Some(guard)
            }
            None => None,
        };

        let key = keys.current().map(|k| k.id);
        let repo = self
            .repositories
            .create(&req.name, &req.path, key, req.connection_id)?;
        if let Err(e) = self.persist(&keys).await {
            let _ = self.repositories.delete(repo.id);
            return Err(e);
        }

        tracing::info!("Registered repository {} ({})", repo.id, repo.name);
        Ok(repo)
    }

    pub async fn list_repositories(&self) -> Vec<RepositoryRef> {
        let _keys = self.keys.read().await;
        self.repositories.list()
    }

    pub async fn delete_repository(&self, id: RepositoryId) -> Result<RepositoryRef, KwError> {
        let keys = self.keys.read().await;
        let repo = self.repositories.delete(id)?;
        self.persist(&keys).await?;
        tracing::info!("Deleted repository {} ({})", repo.id, repo.name);
        Ok(repo)
    }

    // ---- background storage sweep -----------------------------------------

    /// Spawn a refresh for every keyed connection lacking storage telemetry
    ///
    /// Connections with a refresh already in flight are skipped. Returns the
    /// number of refreshes spawned.
    pub fn schedule_missing_storage(self: &Arc<Self>) -> usize {
        let mut scheduled = 0;
        for id in self.connections.missing_storage() {
            let has_key = self
                .connections
                .get(id)
                .is_some_and(|c| c.ssh_key_id.is_some());
            if !has_key {
                continue;
            }
            let Some(claim) = self.in_flight.try_claim(id) else {
                continue;
            };

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let _claim = claim;
                match manager.refresh_storage(id).await {
                    Ok(resp) if !resp.success => tracing::debug!(
                        "Background refresh of connection {} failed: {}",
                        id,
                        resp.error.unwrap_or_default()
                    ),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("Background refresh of connection {} skipped: {}", id, e)
                    }
                }
            });
            scheduled += 1;
        }
        scheduled
    }

    /// Whether a background refresh is running for `id`
    pub fn refresh_in_flight(&self, id: ConnectionId) -> bool {
        self.in_flight.contains(id)
    }

    // ---- helpers ----------------------------------------------------------

    fn registered(&self, fields: &ConnectionFields) -> Option<ConnectionId> {
        self.connections
            .find_by_target(&fields.host, &fields.username, fields.port)
    }

    /// Install the key with a password, then check that it authenticates
    async fn install_and_verify(
        &self,
        key: &ActiveKey,
        target: &RemoteTarget,
        password: &str,
    ) -> Result<(), KwError> {
        self.remote(self.executor.deploy(&key.material, target, password))
            .await?;
        self.remote(self.executor.probe(&key.material, target))
            .await
            .map_err(ExecError::into_verification_error)
    }

    async fn remote<T>(
        &self,
        call: impl Future<Output = Result<T, ExecError>>,
    ) -> Result<T, ExecError> {
        with_deadline(self.config.remote_deadline(), call).await
    }

    /// Write the current state
    ///
    /// Takes the key store from the caller's guard so the snapshot matches
    /// what the caller just committed.
    async fn persist(&self, keys: &KeyStore) -> Result<(), KwError> {
        let Some(state_file) = &self.state_file else {
            return Ok(());
        };
        state_file
            .save_with(|| snapshot(keys, &self.connections, &self.repositories))
            .await
            .map_err(|e| {
                tracing::error!("Failed to persist state: {}", e);
                e
            })
    }

    /// Persist after an upsert; a row created by it is dropped if the write fails
    async fn persist_row(
        &self,
        keys: &KeyStore,
        created: Option<ConnectionId>,
    ) -> Result<(), KwError> {
        let result = self.persist(keys).await;
        if let (Err(_), Some(id)) = (&result, created) {
            let _ = self.connections.delete(id);
            self.locks.forget(id);
        }
        result
    }
}

fn snapshot(
    keys: &KeyStore,
    connections: &ConnectionRegistry,
    repositories: &RepositoryRegistry,
) -> StateSnapshot {
    StateSnapshot {
        next_key_id: keys.next_id(),
        next_connection_id: connections.next_id(),
        next_repository_id: repositories.next_id(),
        system_key: keys.current().cloned(),
        connections: connections.list(),
        repositories: repositories.list(),
    }
}

/// Undo an install whose state could not be saved
fn discard_unsaved_key(keys: &mut KeyStore, id: KeyId) {
    if let Err(e) = keys.remove(id) {
        tracing::error!("Failed to discard unsaved system key {}: {}", id, e);
    }
}

/// The current key, checked against the id a client expects
fn current_key(keys: &KeyStore, expected: Option<KeyId>) -> Result<ActiveKey, KwError> {
    let key = keys.require()?;
    match expected {
        Some(expected) if expected != key.id() => Err(KwError::Precondition(format!(
            "system key {} no longer exists (current key is {})",
            expected,
            key.id()
        ))),
        _ => Ok(key),
    }
}

/// The current key if it is the one `conn` was deployed with
fn usable_key(keys: &KeyStore, conn: &SshConnection) -> Option<ActiveKey> {
    keys.active()
        .filter(|key| conn.ssh_key_id == Some(key.id()))
}

fn key_name(name: Option<String>) -> String {
    non_blank(name).unwrap_or_else(|| DEFAULT_KEY_NAME.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
