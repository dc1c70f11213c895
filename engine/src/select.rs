//! Serving changes to a requesting scope.
//!
//! [`ChangeSelector`] executes the two select commands against a
//! [`SyncStore`]: the initial full-table read and the incremental read that
//! applies echo suppression and column-mask narrowing.

use crate::{
    error::Result, ChangeEntry, ChangeOperation, ChangeRecord, PrimaryKey, Row, ScopeId,
    SelectIncremental, SelectInitial, SyncStore, TableSchema, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Changes served to a scope, with the watermark that covers them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub changes: Vec<ChangeRecord>,
    /// Source timestamp captured before reading; every change at or below it
    /// is included, so it is safe to use as the requester's next watermark.
    pub upper_bound: Timestamp,
}

/// How one feed entry is turned into a change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPlan {
    /// Not sent: echo, no-op update, or beyond the upper bound.
    Skip(SkipReason),
    Tombstone,
    /// Send the current row, restricted to these columns (`None` = all
    /// mutable columns).
    Row(Option<Vec<String>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Echo,
    EmptyMask,
    AfterUpperBound,
}

/// Decide how to serve one feed entry.
///
/// Masks are trusted only for updates, and only when the command allows
/// them. An insert (including an insert followed by updates before this
/// sync) always carries the full row because the requester has never seen
/// it. An update whose mask names no mutable column changed only untracked
/// metadata and is dropped.
pub fn plan_entry(
    schema: &TableSchema,
    command: &SelectIncremental,
    entry: &ChangeEntry,
    upper_bound: Timestamp,
) -> EntryPlan {
    if entry.timestamp > upper_bound {
        return EntryPlan::Skip(SkipReason::AfterUpperBound);
    }

    if entry.origin_scope.as_ref() == Some(&command.requesting_scope) {
        return EntryPlan::Skip(SkipReason::Echo);
    }

    match entry.operation {
        ChangeOperation::Delete => EntryPlan::Tombstone,
        ChangeOperation::Insert => EntryPlan::Row(None),
        ChangeOperation::Update => {
            let mask = match &entry.changed_columns {
                Some(mask) if command.use_column_masks => mask,
                _ => return EntryPlan::Row(None),
            };

            let columns: Vec<String> = schema
                .mutable_columns(false)
                .into_iter()
                .filter(|c| mask.contains(&c.name))
                .map(|c| c.name.clone())
                .collect();

            if columns.is_empty() {
                EntryPlan::Skip(SkipReason::EmptyMask)
            } else {
                EntryPlan::Row(Some(columns))
            }
        }
    }
}

/// Executes select commands against a store.
pub struct ChangeSelector<'a> {
    store: &'a dyn SyncStore,
    /// Scope id of the source store; stamped on local changes it serves.
    local_scope: Option<&'a ScopeId>,
}

impl<'a> ChangeSelector<'a> {
    pub fn new(store: &'a dyn SyncStore, local_scope: Option<&'a ScopeId>) -> Self {
        Self { store, local_scope }
    }

    fn origin_of(&self, origin: Option<ScopeId>) -> Option<ScopeId> {
        origin.or_else(|| self.local_scope.cloned())
    }

    /// Every current row, stamped with the current timestamp.
    ///
    /// Nothing is suppressed here. Rows keep the origin of their last
    /// tracked change, so a requester that still holds a row it wrote
    /// itself can tell it apart from a row it lost.
    pub async fn select_initial(
        &self,
        schema: &TableSchema,
        command: &SelectInitial,
    ) -> Result<ChangeBatch> {
        let upper_bound = self.store.current_timestamp().await?;
        let origins: BTreeMap<PrimaryKey, Option<ScopeId>> = self
            .store
            .changes_since(schema, 0)
            .await?
            .into_iter()
            .map(|e| (e.primary_key, e.origin_scope))
            .collect();
        let rows = self.store.scan(schema, command).await?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let key = schema.key_of(&row)?;
            let origin = origins.get(&key).cloned().flatten();
            changes.push(ChangeRecord::upsert(
                key,
                schema.mutable_values(&row),
                self.origin_of(origin),
                upper_bound,
            ));
        }

        tracing::debug!(
            table = %schema.name(),
            rows = changes.len(),
            upper_bound,
            "Selected initial rows"
        );

        Ok(ChangeBatch {
            changes,
            upper_bound,
        })
    }

    /// Changes after the command's minimum timestamp, minus the requester's
    /// own changes.
    pub async fn select_incremental(
        &self,
        schema: &TableSchema,
        command: &SelectIncremental,
    ) -> Result<ChangeBatch> {
        let upper_bound = self.store.current_timestamp().await?;
        let entries = self
            .store
            .changes_since(schema, command.min_timestamp)
            .await?;

        let planned: Vec<(ChangeEntry, EntryPlan)> = entries
            .into_iter()
            .filter(|e| e.timestamp > command.min_timestamp)
            .map(|e| {
                let plan = plan_entry(schema, command, &e, upper_bound);
                (e, plan)
            })
            .collect();

        let keys: Vec<PrimaryKey> = planned
            .iter()
            .filter(|(_, plan)| matches!(plan, EntryPlan::Row(_)))
            .map(|(e, _)| e.primary_key.clone())
            .collect();
        let rows = if keys.is_empty() {
            Default::default()
        } else {
            self.store.fetch_rows(schema, &keys).await?
        };

        let mut changes = Vec::new();
        let mut skipped = 0usize;
        for (entry, plan) in planned {
            match plan {
                EntryPlan::Skip(reason) => {
                    tracing::trace!(key = %entry.primary_key, ?reason, "Skipping change");
                    skipped += 1;
                }
                EntryPlan::Tombstone => changes.push(ChangeRecord::tombstone(
                    entry.primary_key,
                    self.origin_of(entry.origin_scope),
                    entry.timestamp,
                )),
                EntryPlan::Row(columns) => {
                    // Deleted after the feed was read; the tombstone comes next pass.
                    let Some(row) = rows.get(&entry.primary_key) else {
                        skipped += 1;
                        continue;
                    };
                    if let Some(filter) = &command.filter {
                        if !filter.matches(row) {
                            skipped += 1;
                            continue;
                        }
                    }
                    changes.push(ChangeRecord::upsert(
                        entry.primary_key,
                        restrict(schema.mutable_values(row), columns.as_deref()),
                        self.origin_of(entry.origin_scope),
                        entry.timestamp,
                    ));
                }
            }
        }

        tracing::debug!(
            table = %schema.name(),
            requesting_scope = %command.requesting_scope,
            min_timestamp = command.min_timestamp,
            changes = changes.len(),
            skipped,
            "Selected incremental changes"
        );

        Ok(ChangeBatch {
            changes,
            upper_bound,
        })
    }
}

fn restrict(values: Row, columns: Option<&[String]>) -> Row {
    match columns {
        None => values,
        Some(columns) => values
            .into_iter()
            .filter(|(name, _)| columns.iter().any(|c| c == name))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Column, ColumnMask, ColumnType, CommandGenerator};

    fn schema(tracking: bool) -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                Column::key("id", ColumnType::Int),
                Column::mutable("name", ColumnType::String),
                Column::mutable("age", ColumnType::Int),
                Column::read_only("modified_by", ColumnType::String),
            ],
        )
        .unwrap()
        .with_column_change_tracking(tracking)
    }

    fn command(schema: &TableSchema) -> SelectIncremental {
        CommandGenerator::new(schema.clone())
            .select_incremental(10, "b", None)
            .unwrap()
    }

    fn entry(
        operation: ChangeOperation,
        mask: Option<ColumnMask>,
        origin: Option<&str>,
    ) -> ChangeEntry {
        ChangeEntry {
            primary_key: PrimaryKey::single(1),
            timestamp: 15,
            origin_scope: origin.map(Into::into),
            operation,
            changed_columns: mask,
        }
    }

    #[test]
    fn requester_changes_are_echoes() {
        let s = schema(true);
        let e = entry(ChangeOperation::Update, None, Some("b"));
        let plan = plan_entry(&s, &command(&s), &e, 20);
        assert_eq!(plan, EntryPlan::Skip(SkipReason::Echo));

        let e = entry(ChangeOperation::Delete, None, Some("b"));
        let plan = plan_entry(&s, &command(&s), &e, 20);
        assert_eq!(plan, EntryPlan::Skip(SkipReason::Echo));
    }

    #[test]
    fn local_and_foreign_changes_pass() {
        let s = schema(true);
        let plan = plan_entry(&s, &command(&s), &entry(ChangeOperation::Update, None, None), 20);
        assert_eq!(plan, EntryPlan::Row(None));

        let e = entry(ChangeOperation::Update, None, Some("c"));
        let plan = plan_entry(&s, &command(&s), &e, 20);
        assert_eq!(plan, EntryPlan::Row(None));
    }

    #[test]
    fn entries_after_upper_bound_are_deferred() {
        let s = schema(true);
        let plan = plan_entry(&s, &command(&s), &entry(ChangeOperation::Insert, None, None), 14);
        assert_eq!(plan, EntryPlan::Skip(SkipReason::AfterUpperBound));
    }

    #[test]
    fn update_mask_narrows_columns() {
        let s = schema(true);
        let e = entry(ChangeOperation::Update, Some(ColumnMask::of(["age"])), None);
        assert_eq!(
            plan_entry(&s, &command(&s), &e, 20),
            EntryPlan::Row(Some(vec!["age".to_string()]))
        );
    }

    #[test]
    fn empty_or_metadata_only_mask_is_a_noop() {
        let s = schema(true);
        let e = entry(ChangeOperation::Update, Some(ColumnMask::new()), None);
        assert_eq!(
            plan_entry(&s, &command(&s), &e, 20),
            EntryPlan::Skip(SkipReason::EmptyMask)
        );

        let e = entry(ChangeOperation::Update, Some(ColumnMask::of(["modified_by"])), None);
        assert_eq!(
            plan_entry(&s, &command(&s), &e, 20),
            EntryPlan::Skip(SkipReason::EmptyMask)
        );
    }

    #[test]
    fn delete_ignores_mask() {
        let s = schema(true);
        let e = entry(ChangeOperation::Delete, Some(ColumnMask::new()), None);
        assert_eq!(plan_entry(&s, &command(&s), &e, 20), EntryPlan::Tombstone);
    }

    #[test]
    fn insert_always_sends_full_row() {
        let s = schema(true);
        let e = entry(ChangeOperation::Insert, Some(ColumnMask::of(["age"])), None);
        assert_eq!(plan_entry(&s, &command(&s), &e, 20), EntryPlan::Row(None));
    }

    #[test]
    fn mask_ignored_without_column_tracking() {
        let s = schema(false);
        let e = entry(ChangeOperation::Update, Some(ColumnMask::new()), None);
        assert_eq!(plan_entry(&s, &command(&s), &e, 20), EntryPlan::Row(None));
    }

    #[test]
    fn restrict_keeps_listed_columns() {
        let values: Row =
            serde_json::from_value(serde_json::json!({"name": "x", "age": 3})).unwrap();
        let only_age = restrict(values.clone(), Some(&["age".to_string()]));
        assert_eq!(only_age.len(), 1);
        assert!(only_age.contains_key("age"));
        assert_eq!(restrict(values.clone(), None), values);
    }
}
