//! Connection registry implementation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use kw_core::types::{ConnectionFields, SshConnection, StorageInfo};
use kw_core::{ConnectionId, ConnectionStatus, KeyId, KwError};

/// A status transition recorded against a connection
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: ConnectionStatus,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    /// A successful probe
    pub fn connected(at: DateTime<Utc>) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            error_message: None,
            at,
        }
    }

    /// A failed probe or revoked credential
    pub fn failed(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: ConnectionStatus::Failed,
            error_message: Some(message.into()),
            at,
        }
    }
}

/// Parameters for inserting a new row
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub fields: ConnectionFields,
    pub ssh_key_id: Option<KeyId>,
    /// Probe result to record with the insert, if one already happened
    pub initial: Option<StatusChange>,
}

/// Registry of all connections indexed by id
///
/// A `(host, username, port)` triple is registered at most once.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, SshConnection>,
    next_id: AtomicU64,
    /// Serializes the uniqueness check with the write that depends on it
    insert_lock: Mutex<()>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            insert_lock: Mutex::new(()),
        }
    }

    /// Rebuild a registry from persisted rows
    pub fn restore(rows: Vec<SshConnection>, next_id: u64) -> Self {
        let max_id = rows.iter().map(|c| c.id.get()).max().unwrap_or(0);
        let connections = DashMap::new();
        for row in rows {
            connections.insert(row.id, row);
        }
        Self {
            connections,
            next_id: AtomicU64::new(next_id.max(max_id + 1)),
            insert_lock: Mutex::new(()),
        }
    }

    /// Id the next created connection will receive
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Insert a new connection after validating its fields
    ///
    /// Fails with `Conflict` if the triple is already registered.
    pub fn create(&self, new: NewConnection) -> Result<SshConnection, KwError> {
        let fields = new.fields.normalized()?;
        let _guard = self.lock_inserts();
        if let Some(existing) = self.find_by_target(&fields.host, &fields.username, fields.port) {
            return Err(KwError::Conflict(format!(
                "{}@{}:{} is already registered as connection {}",
                fields.username, fields.host, fields.port, existing
            )));
        }
        Ok(self.insert(fields, new.ssh_key_id, new.initial))
    }

    /// Insert a connection, or update the row already registered for its triple
    ///
    /// An existing row keeps its id, creation time and storage snapshot.
    pub fn upsert(&self, new: NewConnection) -> Result<SshConnection, KwError> {
        let fields = new.fields.normalized()?;
        let _guard = self.lock_inserts();
        let Some(id) = self.find_by_target(&fields.host, &fields.username, fields.port) else {
            return Ok(self.insert(fields, new.ssh_key_id, new.initial));
        };

        let mut entry = self.entry(id)?;
        entry.fields = fields;
        entry.ssh_key_id = new.ssh_key_id;
        if let Some(change) = new.initial {
            apply_status(&mut entry, change);
        }
        Ok(entry.value().clone())
    }

    fn insert(
        &self,
        fields: ConnectionFields,
        ssh_key_id: Option<KeyId>,
        initial: Option<StatusChange>,
    ) -> SshConnection {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut conn = SshConnection {
            id,
            ssh_key_id,
            fields,
            status: ConnectionStatus::Untested,
            last_test: None,
            last_success: None,
            error_message: None,
            storage: None,
            created_at: Utc::now(),
        };
        if let Some(change) = initial {
            apply_status(&mut conn, change);
        }

        self.connections.insert(id, conn.clone());
        conn
    }

    /// Replace the editable fields of a connection
    pub fn update_fields(
        &self,
        id: ConnectionId,
        fields: ConnectionFields,
    ) -> Result<SshConnection, KwError> {
        let fields = fields.normalized()?;
        let _guard = self.lock_inserts();
        if let Some(other) = self.find_by_target(&fields.host, &fields.username, fields.port) {
            if other != id {
                return Err(KwError::Conflict(format!(
                    "{}@{}:{} is already registered as connection {}",
                    fields.username, fields.host, fields.port, other
                )));
            }
        }

        let mut entry = self.entry(id)?;
        entry.fields = fields;
        Ok(entry.value().clone())
    }

    /// Get a connection by id
    pub fn get(&self, id: ConnectionId) -> Option<SshConnection> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    /// Get a connection by id or fail with `NotFound`
    pub fn require(&self, id: ConnectionId) -> Result<SshConnection, KwError> {
        self.get(id)
            .ok_or_else(|| KwError::NotFound(format!("connection {}", id)))
    }

    /// List all connections ordered by id
    pub fn list(&self) -> Vec<SshConnection> {
        let mut rows: Vec<SshConnection> = self
            .connections
            .iter()
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|c| c.id);
        rows
    }

    /// Remove a connection
    pub fn delete(&self, id: ConnectionId) -> Result<SshConnection, KwError> {
        self.connections
            .remove(&id)
            .map(|(_, conn)| conn)
            .ok_or_else(|| KwError::NotFound(format!("connection {}", id)))
    }

    /// Record a status transition
    pub fn set_status(
        &self,
        id: ConnectionId,
        change: StatusChange,
    ) -> Result<SshConnection, KwError> {
        let mut entry = self.entry(id)?;
        apply_status(&mut entry, change);
        Ok(entry.value().clone())
    }

    /// Point a connection at a key (or at none)
    pub fn set_key(&self, id: ConnectionId, key: Option<KeyId>) -> Result<(), KwError> {
        self.entry(id)?.ssh_key_id = key;
        Ok(())
    }

    /// Overwrite the storage snapshot; never touches status
    pub fn attach_storage(&self, id: ConnectionId, storage: StorageInfo) -> Result<(), KwError> {
        self.entry(id)?.storage = Some(storage);
        Ok(())
    }

    /// Find the connection registered for a host/user/port triple
    pub fn find_by_target(&self, host: &str, username: &str, port: u32) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|r| r.fields.matches(host, username, port))
            .map(|r| r.id)
    }

    /// Clear every reference to `key` and mark those connections failed
    ///
    /// Returns the number of connections affected.
    pub fn revoke_key(&self, key: KeyId, message: &str, at: DateTime<Utc>) -> usize {
        let mut affected = 0;
        for mut entry in self.connections.iter_mut() {
            if entry.ssh_key_id == Some(key) {
                entry.ssh_key_id = None;
                apply_status(&mut entry, StatusChange::failed(message, at));
                affected += 1;
            }
        }
        affected
    }

    /// Number of connections referencing `key`
    pub fn count_for_key(&self, key: KeyId) -> usize {
        self.connections
            .iter()
            .filter(|r| r.ssh_key_id == Some(key))
            .count()
    }

    /// Ids of connections without a storage snapshot
    pub fn missing_storage(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|r| r.storage.is_none())
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn lock_inserts(&self) -> MutexGuard<'_, ()> {
        self.insert_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry(
        &self,
        id: ConnectionId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, ConnectionId, SshConnection>, KwError> {
        self.connections
            .get_mut(&id)
            .ok_or_else(|| KwError::NotFound(format!("connection {}", id)))
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_status(conn: &mut SshConnection, change: StatusChange) {
    conn.status = change.status;
    conn.last_test = Some(change.at);
    if change.status == ConnectionStatus::Connected {
        conn.last_success = Some(change.at);
        conn.error_message = None;
    } else {
        conn.error_message = change.error_message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_conn(host: &str, key: Option<u64>) -> NewConnection {
        NewConnection {
            fields: ConnectionFields::new(host, "root", 22),
            ssh_key_id: key.map(KeyId),
            initial: None,
        }
    }

    #[test]
    fn test_create_validates_fields() {
        let registry = ConnectionRegistry::new();
        let mut bad = new_conn("host", None);
        bad.fields.port = 0;
        assert!(matches!(
            registry.create(bad),
            Err(KwError::InvalidArgument(_))
        ));
        assert!(registry.is_empty());

        let conn = registry.create(new_conn("host", None)).unwrap();
        assert_eq!(conn.status, ConnectionStatus::Untested);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_with_initial_status() {
        let registry = ConnectionRegistry::new();
        let now = Utc::now();
        let mut new = new_conn("host", Some(1));
        new.initial = Some(StatusChange::connected(now));

        let conn = registry.create(new).unwrap();
        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert_eq!(conn.last_success, Some(now));
    }

    #[test]
    fn test_status_transitions() {
        let registry = ConnectionRegistry::new();
        let conn = registry.create(new_conn("host", Some(1))).unwrap();
        let t1 = Utc::now();

        let ok = registry
            .set_status(conn.id, StatusChange::connected(t1))
            .unwrap();
        assert_eq!(ok.last_success, Some(t1));

        let t2 = Utc::now();
        let failed = registry
            .set_status(conn.id, StatusChange::failed("timeout", t2))
            .unwrap();
        assert_eq!(failed.status, ConnectionStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("timeout"));
        assert_eq!(failed.last_test, Some(t2));
        // Last success is preserved across a failure
        assert_eq!(failed.last_success, Some(t1));

        let back = registry
            .set_status(conn.id, StatusChange::connected(Utc::now()))
            .unwrap();
        assert_eq!(back.error_message, None);
    }

    #[test]
    fn test_attach_storage_keeps_status() {
        let registry = ConnectionRegistry::new();
        let conn = registry.create(new_conn("host", Some(1))).unwrap();
        registry
            .set_status(conn.id, StatusChange::failed("unreachable", Utc::now()))
            .unwrap();

        registry
            .attach_storage(conn.id, StorageInfo::new(100, 50, 50))
            .unwrap();
        let conn = registry.get(conn.id).unwrap();
        assert_eq!(conn.status, ConnectionStatus::Failed);
        assert!(conn.storage.is_some());

        assert!(matches!(
            registry.attach_storage(ConnectionId(42), StorageInfo::new(1, 1, 0)),
            Err(KwError::NotFound(_))
        ));
    }

    #[test]
    fn test_revoke_key_only_touches_matching_rows() {
        let registry = ConnectionRegistry::new();
        let a = registry.create(new_conn("a", Some(1))).unwrap();
        let b = registry.create(new_conn("b", Some(2))).unwrap();
        let c = registry.create(new_conn("c", None)).unwrap();

        let affected = registry.revoke_key(KeyId(1), "system key was removed", Utc::now());
        assert_eq!(affected, 1);

        let a = registry.get(a.id).unwrap();
        assert_eq!(a.ssh_key_id, None);
        assert_eq!(a.status, ConnectionStatus::Failed);
        assert_eq!(registry.get(b.id).unwrap().ssh_key_id, Some(KeyId(2)));
        assert_eq!(
            registry.get(c.id).unwrap().status,
            ConnectionStatus::Untested
        );
    }

    #[test]
    fn test_find_by_target_and_missing_storage() {
        let registry = ConnectionRegistry::new();
        let a = registry.create(new_conn("a", None)).unwrap();
        let b = registry.create(new_conn("b", None)).unwrap();
        registry
            .attach_storage(a.id, StorageInfo::new(1, 0, 1))
            .unwrap();

        assert_eq!(registry.find_by_target("b", "root", 22), Some(b.id));
        assert_eq!(registry.find_by_target("b", "root", 2222), None);
        assert_eq!(registry.missing_storage(), vec![b.id]);
    }

    #[test]
    fn test_duplicate_triple_conflicts() {
        let registry = ConnectionRegistry::new();
        let a = registry.create(new_conn("a", None)).unwrap();
        assert!(matches!(
            registry.create(new_conn("a", None)),
            Err(KwError::Conflict(_))
        ));

        let b = registry.create(new_conn("b", None)).unwrap();
        let moved = registry.update_fields(b.id, ConnectionFields::new("a", "root", 22));
        assert!(matches!(moved, Err(KwError::Conflict(_))));

        // Updating a row to its own triple is fine
        let same = registry.update_fields(a.id, ConnectionFields::new("a", "root", 22));
        assert!(same.is_ok());
    }

    #[test]
    fn test_upsert_updates_existing_row() {
        let registry = ConnectionRegistry::new();
        let first = registry.create(new_conn("a", None)).unwrap();
        registry
            .attach_storage(first.id, StorageInfo::new(10, 5, 5))
            .unwrap();

        let mut again = new_conn("a", Some(7));
        again.fields.mount_point = Some("offsite".into());
        again.initial = Some(StatusChange::connected(Utc::now()));
        let updated = registry.upsert(again).unwrap();

        assert_eq!(updated.id, first.id);
        assert_eq!(updated.ssh_key_id, Some(KeyId(7)));
        assert_eq!(updated.status, ConnectionStatus::Connected);
        assert_eq!(updated.fields.mount_point.as_deref(), Some("offsite"));
        assert!(updated.storage.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_restore_continues_ids() {
        let registry = ConnectionRegistry::new();
        registry.create(new_conn("a", None)).unwrap();
        registry.create(new_conn("b", None)).unwrap();

        let restored = ConnectionRegistry::restore(registry.list(), 1);
        let c = restored.create(new_conn("c", None)).unwrap();
        assert_eq!(c.id, ConnectionId(3));
    }
}
