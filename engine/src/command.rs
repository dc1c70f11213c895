//! Command generation.
//!
//! The generator turns synchronization requests for one table into typed
//! command descriptions. Commands are plain data: they name the table, the
//! columns involved and the parameters of the sync predicates. The engine
//! interprets them against a [`crate::SyncStore`]; a backend that pushes
//! work down to its own query language renders them instead.

use crate::{
    error::Result, ChangeRecord, ColumnName, Error, PrimaryKey, Row, RowFilter, ScopeId,
    TableName, TableSchema, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Full (or filter-restricted) row set for a scope's first synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectInitial {
    pub table: TableName,
    pub key_columns: Vec<ColumnName>,
    pub columns: Vec<ColumnName>,
    pub filter: Option<RowFilter>,
}

/// Changes after `min_timestamp`, excluding those made by the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectIncremental {
    pub table: TableName,
    pub key_columns: Vec<ColumnName>,
    pub columns: Vec<ColumnName>,
    pub min_timestamp: Timestamp,
    pub requesting_scope: ScopeId,
    pub filter: Option<RowFilter>,
    /// Whether column masks reported by the feed may narrow the column set.
    pub use_column_masks: bool,
}

/// Parameters shared by every row of an apply call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyParams {
    /// The local timestamp the caller last synchronized at.
    pub expected_min_timestamp: Timestamp,
    /// Scope whose changes are being applied.
    pub requesting_scope: ScopeId,
    /// Administrative override of the conflict predicate.
    pub force_write: bool,
    /// The rows come from a full initial read of the requesting scope.
    #[serde(default)]
    pub initial: bool,
}

impl ApplyParams {
    pub fn new(expected_min_timestamp: Timestamp, requesting_scope: impl Into<ScopeId>) -> Self {
        Self {
            expected_min_timestamp,
            requesting_scope: requesting_scope.into(),
            force_write: false,
            initial: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_write = true;
        self
    }

    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }
}

/// Insert-or-update of one row, guarded by the conflict predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertCommand {
    pub table: TableName,
    pub primary_key: PrimaryKey,
    /// Column values to write; columns not present are left untouched.
    pub values: Row,
    /// Scope that produced the change, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_scope: Option<ScopeId>,
    #[serde(flatten)]
    pub params: ApplyParams,
}

impl UpsertCommand {
    pub fn with_origin(mut self, origin_scope: Option<ScopeId>) -> Self {
        self.origin_scope = origin_scope;
        self
    }

    /// Origin recorded with the write: the producing scope, or the
    /// requesting scope when the change carries none.
    pub fn origin(&self) -> &ScopeId {
        self.origin_scope
            .as_ref()
            .unwrap_or(&self.params.requesting_scope)
    }
}

/// Delete of one row, guarded by the conflict predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCommand {
    pub table: TableName,
    pub primary_key: PrimaryKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_scope: Option<ScopeId>,
    #[serde(flatten)]
    pub params: ApplyParams,
}

impl DeleteCommand {
    pub fn with_origin(mut self, origin_scope: Option<ScopeId>) -> Self {
        self.origin_scope = origin_scope;
        self
    }

    pub fn origin(&self) -> &ScopeId {
        self.origin_scope
            .as_ref()
            .unwrap_or(&self.params.requesting_scope)
    }
}

/// Drop all tracked state of a table and restart tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetCommand {
    pub table: TableName,
}

/// A row-level write produced from an incoming change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ApplyCommand {
    Upsert(UpsertCommand),
    Delete(DeleteCommand),
}

impl ApplyCommand {
    pub fn primary_key(&self) -> &PrimaryKey {
        match self {
            ApplyCommand::Upsert(cmd) => &cmd.primary_key,
            ApplyCommand::Delete(cmd) => &cmd.primary_key,
        }
    }

    pub fn params(&self) -> &ApplyParams {
        match self {
            ApplyCommand::Upsert(cmd) => &cmd.params,
            ApplyCommand::Delete(cmd) => &cmd.params,
        }
    }
}

/// Every command the generator can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncCommand {
    SelectInitial(SelectInitial),
    SelectIncremental(SelectIncremental),
    Upsert(UpsertCommand),
    UpsertBatch { commands: Vec<UpsertCommand> },
    Delete(DeleteCommand),
    DeleteBatch { commands: Vec<DeleteCommand> },
    Reset(ResetCommand),
}

impl SyncCommand {
    /// Short name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            SyncCommand::SelectInitial(_) => "select_initial",
            SyncCommand::SelectIncremental(_) => "select_incremental",
            SyncCommand::Upsert(_) => "upsert",
            SyncCommand::UpsertBatch { .. } => "upsert_batch",
            SyncCommand::Delete(_) => "delete",
            SyncCommand::DeleteBatch { .. } => "delete_batch",
            SyncCommand::Reset(_) => "reset",
        }
    }
}

/// Generates commands for one table.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    schema: TableSchema,
}

impl CommandGenerator {
    pub fn new(schema: TableSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn key_columns(&self) -> Vec<ColumnName> {
        self.schema
            .primary_key_columns()
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    fn value_columns(&self) -> Vec<ColumnName> {
        self.schema
            .mutable_columns(false)
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Combine the table's own filter with a per-request filter.
    fn effective_filter(&self, filter: Option<RowFilter>) -> Result<Option<RowFilter>> {
        if let Some(extra) = &filter {
            for column in extra.columns() {
                if self.schema.column(column).is_none() {
                    return Err(Error::schema(
                        self.schema.name().clone(),
                        format!("filter references unknown column '{column}'"),
                    ));
                }
            }
        }

        Ok(match (self.schema.filter().cloned(), filter) {
            (Some(base), Some(extra)) => Some(base.and(extra)),
            (base, extra) => base.or(extra),
        })
    }

    pub fn select_initial(&self, filter: Option<RowFilter>) -> Result<SelectInitial> {
        Ok(SelectInitial {
            table: self.schema.name().clone(),
            key_columns: self.key_columns(),
            columns: self.value_columns(),
            filter: self.effective_filter(filter)?,
        })
    }

    pub fn select_incremental(
        &self,
        min_timestamp: Timestamp,
        requesting_scope: impl Into<ScopeId>,
        filter: Option<RowFilter>,
    ) -> Result<SelectIncremental> {
        Ok(SelectIncremental {
            table: self.schema.name().clone(),
            key_columns: self.key_columns(),
            columns: self.value_columns(),
            min_timestamp,
            requesting_scope: requesting_scope.into(),
            filter: self.effective_filter(filter)?,
            use_column_masks: self.schema.has_column_change_tracking(),
        })
    }

    pub fn upsert(
        &self,
        primary_key: PrimaryKey,
        values: Row,
        params: ApplyParams,
    ) -> Result<UpsertCommand> {
        self.schema.validate_key(&primary_key)?;
        self.schema.validate_values(&values)?;
        Ok(UpsertCommand {
            table: self.schema.name().clone(),
            primary_key,
            values,
            origin_scope: None,
            params,
        })
    }

    pub fn upsert_batch(
        &self,
        rows: impl IntoIterator<Item = (PrimaryKey, Row)>,
        params: &ApplyParams,
    ) -> Result<Vec<UpsertCommand>> {
        rows.into_iter()
            .map(|(key, values)| self.upsert(key, values, params.clone()))
            .collect()
    }

    pub fn delete(&self, primary_key: PrimaryKey, params: ApplyParams) -> Result<DeleteCommand> {
        self.schema.validate_key(&primary_key)?;
        Ok(DeleteCommand {
            table: self.schema.name().clone(),
            primary_key,
            origin_scope: None,
            params,
        })
    }

    pub fn delete_batch(
        &self,
        keys: impl IntoIterator<Item = PrimaryKey>,
        params: &ApplyParams,
    ) -> Result<Vec<DeleteCommand>> {
        keys.into_iter()
            .map(|key| self.delete(key, params.clone()))
            .collect()
    }

    /// Turn incoming changes into row writes, preserving their order. Each
    /// write keeps the origin of its change.
    pub fn apply_commands(
        &self,
        changes: &[ChangeRecord],
        params: &ApplyParams,
    ) -> Result<Vec<ApplyCommand>> {
        changes
            .iter()
            .map(|change| {
                let origin = change.origin_scope.clone();
                if change.is_tombstone {
                    self.delete(change.primary_key.clone(), params.clone())
                        .map(|cmd| ApplyCommand::Delete(cmd.with_origin(origin)))
                } else {
                    self.upsert(
                        change.primary_key.clone(),
                        change.column_values.clone(),
                        params.clone(),
                    )
                    .map(|cmd| ApplyCommand::Upsert(cmd.with_origin(origin)))
                }
            })
            .collect()
    }

    pub fn reset(&self) -> ResetCommand {
        ResetCommand {
            table: self.schema.name().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Column, ColumnType};
    use serde_json::json;

    fn generator() -> CommandGenerator {
        let schema = TableSchema::new(
            "users",
            vec![
                Column::key("id", ColumnType::Int),
                Column::mutable("name", ColumnType::String),
                Column::mutable("region", ColumnType::String),
                Column::mutable("seq", ColumnType::Int).auto_increment(),
            ],
        )
        .unwrap()
        .with_filter(RowFilter::ne("region", "archived"))
        .unwrap()
        .with_column_change_tracking(true);
        CommandGenerator::new(schema)
    }

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn select_initial_uses_table_filter() {
        let cmd = generator().select_initial(None).unwrap();
        assert_eq!(cmd.table, "users");
        assert_eq!(cmd.key_columns, vec!["id"]);
        assert_eq!(cmd.columns, vec!["name", "region"]);
        assert_eq!(cmd.filter, Some(RowFilter::ne("region", "archived")));
    }

    #[test]
    fn request_filter_is_combined_with_table_filter() {
        let cmd = generator()
            .select_incremental(10, "scope-b", Some(RowFilter::eq("region", "eu")))
            .unwrap();
        assert_eq!(
            cmd.filter,
            Some(RowFilter::ne("region", "archived").and(RowFilter::eq("region", "eu")))
        );
        assert_eq!(cmd.min_timestamp, 10);
        assert_eq!(cmd.requesting_scope, "scope-b");
        assert!(cmd.use_column_masks);
    }

    #[test]
    fn request_filter_on_unknown_column_is_rejected() {
        let result = generator().select_initial(Some(RowFilter::is_null("nope")));
        assert!(matches!(result, Err(Error::Schema { .. })));
    }

    #[test]
    fn upsert_validates_values() {
        let gen = generator();
        let params = ApplyParams::new(5, "scope-a");

        let cmd = gen
            .upsert(PrimaryKey::single(1), row(json!({"name": "x"})), params.clone())
            .unwrap();
        assert_eq!(cmd.params.expected_min_timestamp, 5);
        assert!(!cmd.params.force_write);

        let err = gen
            .upsert(PrimaryKey::single(1), row(json!({"name": 3})), params.clone())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChange { .. }));

        let err = gen
            .upsert(PrimaryKey::new(vec![]), row(json!({})), params)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChange { .. }));
    }

    #[test]
    fn batch_commands_share_params() {
        let gen = generator();
        let params = ApplyParams::new(5, "scope-a").forced();
        let deletes = gen
            .delete_batch(vec![PrimaryKey::single(1), PrimaryKey::single(2)], &params)
            .unwrap();
        assert_eq!(deletes.len(), 2);
        assert!(deletes.iter().all(|d| d.params.force_write));

        let upserts = gen
            .upsert_batch(vec![(PrimaryKey::single(3), row(json!({"name": "c"})))], &params)
            .unwrap();
        assert_eq!(upserts[0].primary_key, PrimaryKey::single(3));
    }

    #[test]
    fn apply_commands_map_tombstones_to_deletes() {
        let gen = generator();
        let changes = vec![
            ChangeRecord::upsert(PrimaryKey::single(1), row(json!({"name": "a"})), None, 3),
            ChangeRecord::tombstone(PrimaryKey::single(2), None, 4),
        ];
        let cmds = gen
            .apply_commands(&changes, &ApplyParams::new(0, "scope-a"))
            .unwrap();
        assert!(matches!(cmds[0], ApplyCommand::Upsert(_)));
        assert!(matches!(cmds[1], ApplyCommand::Delete(_)));
        assert_eq!(cmds[1].primary_key(), &PrimaryKey::single(2));
    }

    #[test]
    fn apply_commands_keep_the_producing_scope() {
        let gen = generator();
        let changes = vec![
            ChangeRecord::upsert(PrimaryKey::single(1), Row::new(), Some("scope-c".into()), 3),
            ChangeRecord::tombstone(PrimaryKey::single(2), None, 4),
        ];
        let cmds = gen
            .apply_commands(&changes, &ApplyParams::new(0, "scope-b"))
            .unwrap();

        let ApplyCommand::Upsert(upsert) = &cmds[0] else {
            panic!("expected an upsert, got {:?}", cmds[0]);
        };
        assert_eq!(upsert.origin(), "scope-c");
        let ApplyCommand::Delete(delete) = &cmds[1] else {
            panic!("expected a delete, got {:?}", cmds[1]);
        };
        assert_eq!(delete.origin(), "scope-b");
    }

    #[test]
    fn command_serialization_is_tagged() {
        let cmd = SyncCommand::Reset(generator().reset());
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"reset\""));
        assert_eq!(cmd.name(), "reset");

        let upsert = SyncCommand::Upsert(
            generator()
                .upsert(PrimaryKey::single(1), row(json!({"name": "x"})), ApplyParams::new(1, "s"))
                .unwrap(),
        );
        let json = serde_json::to_string(&upsert).unwrap();
        assert!(json.contains("\"expectedMinTimestamp\":1"));
        let parsed: SyncCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, upsert);
    }
}
