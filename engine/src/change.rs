//! Change records exchanged between scopes and per-row apply outcomes.

use crate::{PrimaryKey, Row, ScopeId, Timestamp};
use serde::{Deserialize, Serialize};

/// One row-level change, as exposed to a requesting scope.
///
/// Records are plain data: the transport decides how to serialize them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub primary_key: PrimaryKey,
    /// Mutable column values. When a trusted column mask was available only
    /// the changed columns are present. Empty for tombstones.
    pub column_values: Row,
    /// Scope that produced the change; `None` means a local write.
    pub origin_scope: Option<ScopeId>,
    /// Logical timestamp of the change in the source store.
    pub timestamp: Timestamp,
    pub is_tombstone: bool,
}

impl ChangeRecord {
    /// An insert or update carrying column values.
    pub fn upsert(
        primary_key: PrimaryKey,
        column_values: Row,
        origin_scope: Option<ScopeId>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            primary_key,
            column_values,
            origin_scope,
            timestamp,
            is_tombstone: false,
        }
    }

    /// A delete marker.
    pub fn tombstone(
        primary_key: PrimaryKey,
        origin_scope: Option<ScopeId>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            primary_key,
            column_values: Row::new(),
            origin_scope,
            timestamp,
            is_tombstone: true,
        }
    }

    /// Whether this change originated in `scope`.
    pub fn originated_in(&self, scope: &str) -> bool {
        self.origin_scope.as_deref() == Some(scope)
    }
}

/// Terminal state of one row after an apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RowStatus {
    Applied,
    AppliedTombstone,
    SkippedEcho,
    ConflictRejected,
}

/// Per-row result of a batch apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub primary_key: PrimaryKey,
    pub applied: bool,
    pub conflict: bool,
    pub status: RowStatus,
}

impl ApplyOutcome {
    pub fn new(primary_key: PrimaryKey, status: RowStatus) -> Self {
        Self {
            primary_key,
            applied: matches!(status, RowStatus::Applied | RowStatus::AppliedTombstone),
            conflict: status == RowStatus::ConflictRejected,
            status,
        }
    }
}
