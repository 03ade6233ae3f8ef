//! Durable daemon state
//!
//! Key metadata, connections and repository references are kept in a single
//! JSON document under the data directory. Writes go to a temporary file in
//! the same directory and are renamed into place, so a crash never leaves a
//! half-written state file behind. Private key material is not part of this
//! document; it lives in the key directory.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use kw_core::types::{RepositoryRef, SshConnection, SystemSshKey};
use kw_core::KwError;

/// Everything the daemon needs to rebuild its registries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSnapshot {
    pub next_key_id: u64,
    pub next_connection_id: u64,
    pub next_repository_id: u64,
    pub system_key: Option<SystemSshKey>,
    pub connections: Vec<SshConnection>,
    pub repositories: Vec<RepositoryRef>,
}

/// The on-disk state document
///
/// Snapshots are numbered as they are built and the disk write runs on the
/// blocking pool. A snapshot older than the one already on disk is skipped,
/// so the newest view of the registries always wins.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    /// Generation of the last snapshot built
    built: Mutex<u64>,
    /// Generation of the last snapshot written
    written: Arc<Mutex<u64>>,
}

impl StateFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            built: Mutex::new(0),
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state document; `None` if it has never been written
    pub fn load(&self) -> Result<Option<StateSnapshot>, KwError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KwError::Internal(format!(
                    "failed to read state file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            KwError::Internal(format!(
                "state file {} is corrupt: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Build a snapshot and write it on the blocking pool
    pub async fn save_with(
        &self,
        build: impl FnOnce() -> StateSnapshot,
    ) -> Result<(), KwError> {
        let (generation, json) = self.stage(build)?;
        let path = self.path.clone();
        let written = Arc::clone(&self.written);
        tokio::task::spawn_blocking(move || commit(&path, &written, generation, &json))
            .await
            .map_err(|e| KwError::Internal(format!("state write task failed: {}", e)))?
    }

    /// Build and write a snapshot on the calling thread
    ///
    /// For use outside the runtime, such as while opening the daemon.
    pub fn save_blocking(&self, build: impl FnOnce() -> StateSnapshot) -> Result<(), KwError> {
        let (generation, json) = self.stage(build)?;
        commit(&self.path, &self.written, generation, &json)
    }

    fn stage(
        &self,
        build: impl FnOnce() -> StateSnapshot,
    ) -> Result<(u64, Vec<u8>), KwError> {
        let mut built = self
            .built
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot = build();
        *built += 1;

        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| KwError::Internal(format!("failed to encode state: {}", e)))?;
        Ok((*built, json))
    }
}

fn commit(
    path: &Path,
    written: &Mutex<u64>,
    generation: u64,
    json: &[u8],
) -> Result<(), KwError> {
    let mut last = written
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if *last >= generation {
        return Ok(());
    }

    write_atomic(path, json).map_err(|e| {
        KwError::Internal(format!(
            "failed to write state file {}: {}",
            path.display(),
            e
        ))
    })?;
    *last = generation;
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
