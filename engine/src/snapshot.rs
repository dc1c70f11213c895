//! Scope stores and their snapshot format.
//!
//! A [`ScopeSnapshot`] is the serialized form of every scope record a
//! registry knows about. [`MemoryScopeStore`] keeps records in memory and
//! can export/import snapshots; [`JsonFileScopeStore`] persists a snapshot
//! to a JSON file after every change.

use crate::{error::Result, Error, ScopeId, ScopeStore, SyncScope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Point-in-time copy of a registry's scope records.
///
/// Uses BTreeMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSnapshot {
    pub format_version: u32,
    /// Scope id of the store that owns these records
    pub local_scope: ScopeId,
    pub scopes: BTreeMap<ScopeId, SyncScope>,
}

impl ScopeSnapshot {
    pub fn new(local_scope: impl Into<ScopeId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            local_scope: local_scope.into(),
            scopes: BTreeMap::new(),
        }
    }

    pub fn add_scope(&mut self, scope: SyncScope) {
        self.scopes.insert(scope.scope_id.clone(), scope);
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::Persistence(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Scope records held in memory.
#[derive(Debug, Default)]
pub struct MemoryScopeStore {
    scopes: RwLock<BTreeMap<ScopeId, SyncScope>>,
}

impl MemoryScopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: ScopeSnapshot) -> Self {
        Self {
            scopes: RwLock::new(snapshot.scopes),
        }
    }

    pub async fn export(&self, local_scope: impl Into<ScopeId>) -> ScopeSnapshot {
        let mut snapshot = ScopeSnapshot::new(local_scope);
        snapshot.scopes = self.scopes.read().await.clone();
        snapshot
    }
}

#[async_trait]
impl ScopeStore for MemoryScopeStore {
    async fn load(&self, scope_id: &str) -> Result<Option<SyncScope>> {
        Ok(self.scopes.read().await.get(scope_id).cloned())
    }

    async fn save(&self, scope: &SyncScope) -> Result<()> {
        self.scopes
            .write()
            .await
            .insert(scope.scope_id.clone(), scope.clone());
        Ok(())
    }

    async fn remove(&self, scope_id: &str) -> Result<bool> {
        Ok(self.scopes.write().await.remove(scope_id).is_some())
    }

    async fn list(&self) -> Result<Vec<SyncScope>> {
        Ok(self.scopes.read().await.values().cloned().collect())
    }
}

/// Scope records persisted to a JSON file.
///
/// Every mutation rewrites the whole snapshot through a temporary file and
/// an atomic rename, so a crash leaves either the old or the new file.
#[derive(Debug)]
pub struct JsonFileScopeStore {
    path: PathBuf,
    snapshot: Mutex<ScopeSnapshot>,
}

impl JsonFileScopeStore {
    /// Open the file at `path`, or start empty when it does not exist.
    ///
    /// Fails when the file belongs to a different local scope.
    pub async fn open(path: impl AsRef<Path>, local_scope: impl Into<ScopeId>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let local_scope = local_scope.into();

        let snapshot = match tokio::fs::read_to_string(&path).await {
            Ok(json) => {
                let snapshot = ScopeSnapshot::from_json(&json)?;
                if snapshot.local_scope != local_scope {
                    return Err(Error::Persistence(format!(
                        "scope file belongs to '{}', expected '{}'",
                        snapshot.local_scope, local_scope
                    )));
                }
                snapshot
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ScopeSnapshot::new(local_scope)
            }
            Err(err) => return Err(err.into()),
        };

        tracing::debug!(
            path = %path.display(),
            scopes = snapshot.scopes.len(),
            "Opened scope file"
        );

        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, snapshot: &ScopeSnapshot) -> Result<()> {
        let json = snapshot.to_json()?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ScopeStore for JsonFileScopeStore {
    async fn load(&self, scope_id: &str) -> Result<Option<SyncScope>> {
        Ok(self.snapshot.lock().await.scopes.get(scope_id).cloned())
    }

    async fn save(&self, scope: &SyncScope) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        let mut next = snapshot.clone();
        next.add_scope(scope.clone());
        self.persist(&next).await?;
        *snapshot = next;
        Ok(())
    }

    async fn remove(&self, scope_id: &str) -> Result<bool> {
        let mut snapshot = self.snapshot.lock().await;
        if !snapshot.scopes.contains_key(scope_id) {
            return Ok(false);
        }
        let mut next = snapshot.clone();
        next.scopes.remove(scope_id);
        self.persist(&next).await?;
        *snapshot = next;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<SyncScope>> {
        Ok(self.snapshot.lock().await.scopes.values().cloned().collect())
    }
}
