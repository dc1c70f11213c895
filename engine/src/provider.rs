//! Backend contracts.
//!
//! [`ChangeTrackingProvider`] is the change feed: an append-only, replayable
//! log of changed primary keys with a monotonic version. [`SyncStore`] adds
//! the row access and transactional writes the engine needs to serve and
//! apply changes. Any store with a per-row version log and key lookup can
//! implement both; [`crate::memory::MemoryStore`] is the reference.

use crate::{
    error::Result, ColumnName, DeleteCommand, PrimaryKey, ResetCommand, Row, ScopeId,
    SelectInitial, TableSchema, Timestamp, UpsertCommand,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of change recorded in the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Set of columns modified by a change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMask(BTreeSet<ColumnName>);

impl ColumnMask {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn of<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ColumnName>,
    {
        Self(columns.into_iter().map(Into::into).collect())
    }

    pub fn insert(&mut self, column: impl Into<ColumnName>) {
        self.0.insert(column.into());
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains(column)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn union(&mut self, other: &ColumnMask) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnName> {
        self.0.iter()
    }
}

/// Net change of one key since the requested timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub primary_key: PrimaryKey,
    /// Timestamp of the latest change to the key.
    pub timestamp: Timestamp,
    /// Scope that made the latest change; `None` for local writes.
    pub origin_scope: Option<ScopeId>,
    /// `Insert` when the row was created after the requested timestamp.
    pub operation: ChangeOperation,
    /// Columns changed since the requested timestamp, when the backend
    /// tracks them.
    pub changed_columns: Option<ColumnMask>,
}

/// Tracking metadata of the local copy of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowVersion {
    /// Timestamp of the last tracked change; `None` when the row predates
    /// change tracking.
    pub timestamp: Option<Timestamp>,
    /// Scope that made the last tracked change; `None` for local writes.
    pub origin_scope: Option<ScopeId>,
    /// Whether the business row currently exists.
    pub exists: bool,
}

/// The store's change feed.
#[async_trait]
pub trait ChangeTrackingProvider: Send + Sync {
    /// Net changes with a timestamp greater than `min_timestamp`, ordered by
    /// timestamp.
    ///
    /// Must be replayable: calling again with the same `min_timestamp`
    /// returns the same or a superset of entries.
    async fn changes_since(
        &self,
        table: &TableSchema,
        min_timestamp: Timestamp,
    ) -> Result<Vec<ChangeEntry>>;

    /// A fresh upper bound usable as the next watermark.
    async fn current_timestamp(&self) -> Result<Timestamp>;
}

/// Row access and transactional writes on top of a change feed.
#[async_trait]
pub trait SyncStore: ChangeTrackingProvider {
    /// Oldest watermark the feed can serve incrementally. A scope whose
    /// watermark is older must be reinitialized.
    async fn min_valid_timestamp(&self, table: &TableSchema) -> Result<Timestamp>;

    /// Current rows matching the command's filter, ordered by key.
    async fn scan(&self, table: &TableSchema, command: &SelectInitial) -> Result<Vec<Row>>;

    /// Current rows for the given keys. Missing keys are absent from the map.
    async fn fetch_rows(
        &self,
        table: &TableSchema,
        keys: &[PrimaryKey],
    ) -> Result<BTreeMap<PrimaryKey, Row>>;

    /// Open a transaction. Dropping it without committing rolls back.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>>;

    /// Drop tracked state for the table and restart tracking. Returns the
    /// new minimum valid timestamp.
    async fn reset(&self, table: &TableSchema, command: &ResetCommand) -> Result<Timestamp>;
}

/// Writes performed inside one store transaction.
///
/// The engine decides whether a write is allowed before issuing it; the
/// commands still carry the predicate parameters for backends that check
/// them again.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn row_version(
        &mut self,
        table: &TableSchema,
        key: &PrimaryKey,
    ) -> Result<Option<RowVersion>>;

    /// Insert the row if absent, otherwise overwrite the given columns.
    /// Records the change in the feed with the command's requesting scope
    /// as origin.
    async fn upsert(&mut self, table: &TableSchema, command: &UpsertCommand) -> Result<()>;

    /// Delete the row and always log a tombstone, even when the row was
    /// already absent. Returns whether a business row was removed.
    async fn delete(&mut self, table: &TableSchema, command: &DeleteCommand) -> Result<bool>;

    /// Commit and return the store's timestamp as of the commit.
    async fn commit(self: Box<Self>) -> Result<Timestamp>;
}
