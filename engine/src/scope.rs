//! Scope and watermark registry.
//!
//! One registry exists per synchronized store. It knows the store's own
//! scope id and, for every remote scope the store has synchronized with,
//! the watermark up to which that scope's changes have been applied. The
//! watermark is the only durable cross-session state the engine needs.

use crate::{error::Result, Error, ScopeId, Timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Generate a fresh, globally unique scope id.
pub fn new_scope_id() -> ScopeId {
    uuid::Uuid::new_v4().to_string()
}

/// Synchronization state of one remote scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncScope {
    pub scope_id: ScopeId,
    /// Source timestamp up to which this scope's changes have been applied.
    pub last_watermark: Timestamp,
    /// Local timestamp as of the last committed batch from this scope.
    pub local_anchor: Timestamp,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncScope {
    /// A scope seen for the first time.
    pub fn new(scope_id: impl Into<ScopeId>) -> Self {
        Self {
            scope_id: scope_id.into(),
            last_watermark: 0,
            local_anchor: 0,
            created_at: Utc::now(),
            last_synced_at: None,
        }
    }

    /// Move the watermark forward. Equal values are accepted.
    pub fn advance(&mut self, watermark: Timestamp, local_anchor: Option<Timestamp>) -> Result<()> {
        if watermark < self.last_watermark {
            return Err(Error::OutOfOrderWatermark {
                scope: self.scope_id.clone(),
                current: self.last_watermark,
                attempted: watermark,
            });
        }
        self.last_watermark = watermark;
        if let Some(anchor) = local_anchor {
            self.local_anchor = self.local_anchor.max(anchor);
        }
        self.last_synced_at = Some(Utc::now());
        Ok(())
    }
}

/// Durable storage for scope records.
#[async_trait]
pub trait ScopeStore: Send + Sync {
    async fn load(&self, scope_id: &str) -> Result<Option<SyncScope>>;

    async fn save(&self, scope: &SyncScope) -> Result<()>;

    /// Returns whether a record was removed.
    async fn remove(&self, scope_id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<SyncScope>>;
}

/// Per-store registry of remote scopes and their watermarks.
///
/// Safe to share between concurrent sessions: reads go straight to the
/// scope store, while every mutation of a scope runs under that scope's
/// lock so advancement is serialized per scope.
pub struct ScopeRegistry {
    local_scope: ScopeId,
    store: Arc<dyn ScopeStore>,
    locks: DashMap<ScopeId, Arc<Mutex<()>>>,
}

impl ScopeRegistry {
    pub fn new(local_scope: impl Into<ScopeId>, store: Arc<dyn ScopeStore>) -> Self {
        Self {
            local_scope: local_scope.into(),
            store,
            locks: DashMap::new(),
        }
    }

    /// Registry backed by an in-memory scope store.
    pub fn in_memory(local_scope: impl Into<ScopeId>) -> Self {
        Self::new(
            local_scope,
            Arc::new(crate::snapshot::MemoryScopeStore::new()),
        )
    }

    /// Scope id of the store this registry belongs to.
    pub fn local_scope(&self) -> &ScopeId {
        &self.local_scope
    }

    fn lock_for(&self, scope_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(scope_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn scope(&self, scope_id: &str) -> Result<Option<SyncScope>> {
        self.store.load(scope_id).await
    }

    /// Watermark of a scope; 0 when the scope has never synchronized.
    pub async fn get_watermark(&self, scope_id: &str) -> Result<Timestamp> {
        Ok(self
            .store
            .load(scope_id)
            .await?
            .map(|s| s.last_watermark)
            .unwrap_or(0))
    }

    /// Local anchor of a scope; 0 when the scope has never synchronized.
    pub async fn local_anchor(&self, scope_id: &str) -> Result<Timestamp> {
        Ok(self
            .store
            .load(scope_id)
            .await?
            .map(|s| s.local_anchor)
            .unwrap_or(0))
    }

    /// Return the scope record, creating it on first contact.
    pub async fn ensure_scope(&self, scope_id: &str) -> Result<SyncScope> {
        let lock = self.lock_for(scope_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.load(scope_id).await? {
            return Ok(existing);
        }

        let scope = SyncScope::new(scope_id);
        self.store.save(&scope).await?;
        tracing::info!(scope = %scope_id, "Registered new sync scope");
        Ok(scope)
    }

    /// Move a scope's watermark forward. Call only after the changes up to
    /// `watermark` are durably applied.
    pub async fn advance_watermark(
        &self,
        scope_id: &str,
        watermark: Timestamp,
    ) -> Result<SyncScope> {
        self.advance(scope_id, watermark, None).await
    }

    /// Move a scope's watermark forward and record the local anchor of the
    /// commit that made it durable.
    pub async fn advance(
        &self,
        scope_id: &str,
        watermark: Timestamp,
        local_anchor: Option<Timestamp>,
    ) -> Result<SyncScope> {
        let lock = self.lock_for(scope_id);
        let _guard = lock.lock().await;

        let mut scope = self
            .store
            .load(scope_id)
            .await?
            .unwrap_or_else(|| SyncScope::new(scope_id));

        let previous = scope.last_watermark;
        if let Err(err) = scope.advance(watermark, local_anchor) {
            tracing::error!(
                scope = %scope_id,
                current = previous,
                attempted = watermark,
                "Rejected backward watermark"
            );
            return Err(err);
        }
        self.store.save(&scope).await?;

        tracing::debug!(scope = %scope_id, from = previous, to = watermark, "Advanced watermark");
        Ok(scope)
    }

    /// Raise a scope's local anchor without moving its watermark. Used once
    /// the scope has received every local change up to `local_anchor`.
    pub async fn raise_local_anchor(
        &self,
        scope_id: &str,
        local_anchor: Timestamp,
    ) -> Result<SyncScope> {
        let lock = self.lock_for(scope_id);
        let _guard = lock.lock().await;

        let mut scope = self
            .store
            .load(scope_id)
            .await?
            .unwrap_or_else(|| SyncScope::new(scope_id));
        if local_anchor > scope.local_anchor {
            scope.local_anchor = local_anchor;
            self.store.save(&scope).await?;
        }
        Ok(scope)
    }

    /// Administrative removal of a scope. Its next sync starts from scratch.
    ///
    /// The scope's lock entry stays, so tasks already waiting on it keep
    /// serializing with later writers.
    pub async fn remove_scope(&self, scope_id: &str) -> Result<bool> {
        let lock = self.lock_for(scope_id);
        let removed = {
            let _guard = lock.lock().await;
            self.store.remove(scope_id).await?
        };

        if removed {
            tracing::info!(scope = %scope_id, "Removed sync scope");
        }
        Ok(removed)
    }

    /// All known scopes, ordered by id.
    pub async fn scopes(&self) -> Result<Vec<SyncScope>> {
        let mut scopes = self.store.list().await?;
        scopes.sort_by(|a, b| a.scope_id.cmp(&b.scope_id));
        Ok(scopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scope_has_zero_watermark() {
        let registry = ScopeRegistry::in_memory("local");
        assert_eq!(registry.get_watermark("remote").await.unwrap(), 0);
        assert_eq!(registry.local_anchor("remote").await.unwrap(), 0);
        assert!(registry.scope("remote").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ensure_scope_creates_once() {
        let registry = ScopeRegistry::in_memory("local");
        let first = registry.ensure_scope("remote").await.unwrap();
        registry.advance_watermark("remote", 5).await.unwrap();
        let second = registry.ensure_scope("remote").await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.last_watermark, 5);
    }

    #[tokio::test]
    async fn watermark_only_moves_forward() {
        let registry = ScopeRegistry::in_memory("local");
        registry.advance_watermark("remote", 10).await.unwrap();
        registry.advance_watermark("remote", 10).await.unwrap();
        registry.advance_watermark("remote", 12).await.unwrap();

        let err = registry.advance_watermark("remote", 11).await.unwrap_err();
        assert_eq!(
            err,
            Error::OutOfOrderWatermark {
                scope: "remote".into(),
                current: 12,
                attempted: 11,
            }
        );
        assert_eq!(registry.get_watermark("remote").await.unwrap(), 12);
    }

    #[tokio::test]
    async fn local_anchor_never_decreases() {
        let registry = ScopeRegistry::in_memory("local");
        registry.advance("remote", 3, Some(40)).await.unwrap();
        registry.advance("remote", 4, Some(35)).await.unwrap();
        assert_eq!(registry.local_anchor("remote").await.unwrap(), 40);

        let scope = registry.advance_watermark("remote", 5).await.unwrap();
        assert_eq!(scope.local_anchor, 40);
        assert!(scope.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn raise_local_anchor_keeps_watermark() {
        let registry = ScopeRegistry::in_memory("local");
        registry.advance("remote", 6, Some(2)).await.unwrap();

        let scope = registry.raise_local_anchor("remote", 9).await.unwrap();
        assert_eq!((scope.last_watermark, scope.local_anchor), (6, 9));

        let scope = registry.raise_local_anchor("remote", 4).await.unwrap();
        assert_eq!(scope.local_anchor, 9);
    }

    #[tokio::test]
    async fn remove_scope_resets_state() {
        let registry = ScopeRegistry::in_memory("local");
        registry.advance_watermark("remote", 9).await.unwrap();

        assert!(registry.remove_scope("remote").await.unwrap());
        assert!(!registry.remove_scope("remote").await.unwrap());
        assert_eq!(registry.get_watermark("remote").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn removal_keeps_the_scope_lock() {
        let registry = ScopeRegistry::in_memory("local");
        registry.advance_watermark("remote", 3).await.unwrap();

        let held = registry.lock_for("remote");
        registry.remove_scope("remote").await.unwrap();
        assert!(Arc::ptr_eq(&held, &registry.lock_for("remote")));

        // A writer that queued on the old lock still excludes new ones.
        let _guard = held.lock().await;
        assert!(registry.lock_for("remote").try_lock().is_err());
    }

    #[tokio::test]
    async fn concurrent_advances_are_serialized() {
        let registry = Arc::new(ScopeRegistry::in_memory("local"));
        let mut handles = Vec::new();
        for t in 1..=50u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let _ = registry.advance_watermark("remote", t).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.get_watermark("remote").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn scopes_are_listed_by_id() {
        let registry = ScopeRegistry::in_memory("local");
        registry.ensure_scope("b").await.unwrap();
        registry.ensure_scope("a").await.unwrap();
        let ids: Vec<_> = registry
            .scopes()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.scope_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn generated_scope_ids_are_unique() {
        assert_ne!(new_scope_id(), new_scope_id());
    }
}
