//! Key store
//!
//! Owns the single system key. The store itself is a plain struct; the
//! lifecycle manager keeps it behind the lock that also serializes the
//! delete cascade, so "at most one key" holds at every observation point.

mod files;
mod material;

pub use files::{secure_erase, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};
pub use material::{derived_public_path, KeyMaterial, MIN_RSA_BITS};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use kw_core::types::SystemSshKey;
use kw_core::{KeyId, KwError};

/// The system key as handed to remote operations
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub record: SystemSshKey,
    pub material: Arc<KeyMaterial>,
}

impl ActiveKey {
    pub fn id(&self) -> KeyId {
        self.record.id
    }
}

/// Holder of the zero-or-one system key
#[derive(Debug)]
pub struct KeyStore {
    slot: Option<ActiveKey>,
    /// Where key material is persisted; `None` keeps it in memory only
    key_dir: Option<PathBuf>,
    next_id: u64,
}

impl KeyStore {
    /// Create a store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            slot: None,
            key_dir: None,
            next_id: 1,
        }
    }

    /// Rebuild the store from persisted metadata
    ///
    /// Returns the store and, if the recorded key could not be reloaded, the
    /// dropped record so the caller can cascade its dependents.
    pub fn restore(
        key_dir: Option<PathBuf>,
        record: Option<SystemSshKey>,
        next_id: u64,
    ) -> (Self, Option<SystemSshKey>) {
        let mut store = Self {
            slot: None,
            key_dir,
            next_id: next_id.max(1),
        };
        if let Some(record) = &record {
            store.next_id = store.next_id.max(record.id.get() + 1);
        }

        let Some(record) = record else {
            return (store, None);
        };

        match store.load_material(&record) {
            Ok(material) => {
                tracing::info!(
                    "Restored system key {} ({}, {})",
                    record.id,
                    record.key_type,
                    record.fingerprint
                );
                store.slot = Some(ActiveKey {
                    record,
                    material: Arc::new(material),
                });
                (store, None)
            }
            Err(e) => {
                tracing::warn!("Dropping system key {}: {}", record.id, e);
                (store, Some(record))
            }
        }
    }

    fn load_material(&self, record: &SystemSshKey) -> Result<KeyMaterial, KwError> {
        let dir = self
            .key_dir
            .as_ref()
            .ok_or_else(|| KwError::NotFound("no key directory configured".into()))?;
        let path = dir.join(PRIVATE_KEY_FILE);
        let pem = std::fs::read_to_string(&path).map_err(|e| {
            KwError::NotFound(format!("private key {} unreadable: {}", path.display(), e))
        })?;
        let material = KeyMaterial::from_openssh(&pem)?;
        if material.fingerprint() != record.fingerprint {
            return Err(KwError::InvalidArgument(format!(
                "private key fingerprint {} does not match recorded {}",
                material.fingerprint(),
                record.fingerprint
            )));
        }
        Ok(material)
    }

    /// Public projection of the current key
    pub fn current(&self) -> Option<&SystemSshKey> {
        self.slot.as_ref().map(|k| &k.record)
    }

    /// Current key including material, for remote operations
    pub fn active(&self) -> Option<ActiveKey> {
        self.slot.clone()
    }

    /// Current key, or `Precondition` if none exists
    pub fn require(&self) -> Result<ActiveKey, KwError> {
        self.active().ok_or_else(|| {
            KwError::Precondition("no system key exists; generate or import one first".into())
        })
    }

    /// Id the next installed key will receive
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Fail with `Conflict` if a key is already installed
    pub fn ensure_vacant(&self) -> Result<(), KwError> {
        match &self.slot {
            Some(existing) => Err(KwError::Conflict(format!(
                "system key {} already exists; delete it first",
                existing.record.id
            ))),
            None => Ok(()),
        }
    }

    /// Install new material as the system key
    pub fn install(
        &mut self,
        material: KeyMaterial,
        name: String,
        description: Option<String>,
    ) -> Result<SystemSshKey, KwError> {
        self.ensure_vacant()?;

        let record = SystemSshKey {
            id: KeyId(self.next_id),
            name,
            description,
            key_type: material.key_type()?,
            fingerprint: material.fingerprint(),
            public_key: material.public_openssh()?,
            created_at: Utc::now(),
        };

        if let Some(dir) = &self.key_dir {
            let private_path = dir.join(PRIVATE_KEY_FILE);
            let public_path = dir.join(PUBLIC_KEY_FILE);
            let written = material
                .with_private_openssh(|pem| files::write_private(&private_path, pem))?
                .and_then(|_| files::write_public(&public_path, &record.public_key));
            if let Err(e) = written {
                let _ = files::secure_erase(&private_path);
                let _ = files::remove_if_exists(&public_path);
                return Err(KwError::Internal(format!(
                    "failed to store key material: {}",
                    e
                )));
            }
        }

        self.next_id += 1;
        self.slot = Some(ActiveKey {
            record: record.clone(),
            material: Arc::new(material),
        });
        Ok(record)
    }

    /// Remove the key with the given id and erase its material
    ///
    /// The public file goes first, so a failure leaves the private half and
    /// the slot intact.
    pub fn remove(&mut self, id: KeyId) -> Result<SystemSshKey, KwError> {
        match &self.slot {
            Some(current) if current.record.id == id => {}
            Some(_) => return Err(KwError::NotFound(format!("system key {}", id))),
            None => return Err(KwError::NotFound("no system key exists".into())),
        }

        if let Some(dir) = &self.key_dir {
            files::remove_if_exists(&dir.join(PUBLIC_KEY_FILE))
                .map_err(|e| KwError::Internal(format!("failed to remove public key: {}", e)))?;
            secure_erase(&dir.join(PRIVATE_KEY_FILE))
                .map_err(|e| KwError::Internal(format!("failed to erase private key: {}", e)))?;
        }

        let removed = self.slot.take().map(|k| k.record);
        removed.ok_or_else(|| KwError::NotFound("no system key exists".into()))
    }
}
