//! Repository references
//!
//! Backup repositories that authenticate with the system key. They hold
//! weak references to the key and optionally to a connection; both are
//! cleared, never left dangling, when the referenced record goes away.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;

use kw_core::types::RepositoryRef;
use kw_core::{ConnectionId, KeyId, KwError, RepositoryId};

/// Registry of repository references
#[derive(Debug)]
pub struct RepositoryRegistry {
    repositories: DashMap<RepositoryId, RepositoryRef>,
    next_id: AtomicU64,
}

impl RepositoryRegistry {
    pub fn new() -> Self {
        Self {
            repositories: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Rebuild from persisted rows
    pub fn restore(rows: Vec<RepositoryRef>, next_id: u64) -> Self {
        let max_id = rows.iter().map(|r| r.id.get()).max().unwrap_or(0);
        let repositories = DashMap::new();
        for row in rows {
            repositories.insert(row.id, row);
        }
        Self {
            repositories,
            next_id: AtomicU64::new(next_id.max(max_id + 1)),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Register a repository
    pub fn create(
        &self,
        name: &str,
        path: &str,
        ssh_key_id: Option<KeyId>,
        connection_id: Option<ConnectionId>,
    ) -> Result<RepositoryRef, KwError> {
        let name = name.trim();
        let path = path.trim();
        if name.is_empty() {
            return Err(KwError::InvalidArgument(
                "repository name must not be empty".into(),
            ));
        }
        if path.is_empty() {
            return Err(KwError::InvalidArgument(
                "repository path must not be empty".into(),
            ));
        }

        let repo = RepositoryRef {
            id: RepositoryId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            name: name.to_string(),
            path: path.to_string(),
            ssh_key_id,
            connection_id,
            created_at: Utc::now(),
        };
        self.repositories.insert(repo.id, repo.clone());
        Ok(repo)
    }

    /// All repositories ordered by id
    pub fn list(&self) -> Vec<RepositoryRef> {
        let mut rows: Vec<RepositoryRef> = self
            .repositories
            .iter()
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn delete(&self, id: RepositoryId) -> Result<RepositoryRef, KwError> {
        self.repositories
            .remove(&id)
            .map(|(_, repo)| repo)
            .ok_or_else(|| KwError::NotFound(format!("repository {}", id)))
    }

    /// Drop every reference to `key`; returns how many were cleared
    pub fn clear_key(&self, key: KeyId) -> usize {
        let mut cleared = 0;
        for mut entry in self.repositories.iter_mut() {
            if entry.ssh_key_id == Some(key) {
                entry.ssh_key_id = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Drop every reference to `connection`; returns how many were cleared
    pub fn clear_connection(&self, connection: ConnectionId) -> usize {
        let mut cleared = 0;
        for mut entry in self.repositories.iter_mut() {
            if entry.connection_id == Some(connection) {
                entry.connection_id = None;
                cleared += 1;
            }
        }
        cleared
    }

    pub fn count_for_key(&self, key: KeyId) -> usize {
        self.repositories
            .iter()
            .filter(|r| r.ssh_key_id == Some(key))
            .count()
    }

    pub fn count_for_connection(&self, connection: ConnectionId) -> usize {
        self.repositories
            .iter()
            .filter(|r| r.connection_id == Some(connection))
            .count()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

impl Default for RepositoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_requires_name_and_path() {
        let registry = RepositoryRegistry::new();
        assert!(registry.create(" ", "/backups", None, None).is_err());
        assert!(registry.create("nightly", "", None, None).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_key_counts_matches() {
        let registry = RepositoryRegistry::new();
        registry
            .create("a", "ssh://a/repo", Some(KeyId(1)), None)
            .unwrap();
        registry
            .create("b", "ssh://b/repo", Some(KeyId(2)), None)
            .unwrap();

        assert_eq!(registry.count_for_key(KeyId(1)), 1);
        assert_eq!(registry.clear_key(KeyId(1)), 1);
        assert_eq!(registry.list()[0].ssh_key_id, None);
        assert_eq!(registry.count_for_key(KeyId(2)), 1);
    }

    #[test]
    fn test_clear_connection() {
        let registry = RepositoryRegistry::new();
        registry
            .create("a", "/srv/borg", Some(KeyId(1)), Some(ConnectionId(4)))
            .unwrap();
        assert_eq!(registry.count_for_connection(ConnectionId(4)), 1);
        assert_eq!(registry.clear_connection(ConnectionId(4)), 1);

        let repo = &registry.list()[0];
        assert_eq!(repo.connection_id, None);
        assert_eq!(repo.ssh_key_id, Some(KeyId(1)));
    }
}
