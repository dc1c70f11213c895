//! Table schema definition and validation.
//!
//! A [`TableSchema`] is the explicit description of a synchronized table:
//! its columns, which of them form the primary key, which may be written by
//! synchronization, and an optional row filter. Schemas are supplied by the
//! host and never change during a session.

use crate::{error::Result, ColumnName, Error, KeyValue, PrimaryKey, Row, RowFilter, TableName};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Column types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::String => write!(f, "String"),
            ColumnType::Int => write!(f, "Int"),
            ColumnType::Float => write!(f, "Float"),
            ColumnType::Bool => write!(f, "Bool"),
            ColumnType::Timestamp => write!(f, "Timestamp"),
            ColumnType::Json => write!(f, "Json"),
        }
    }
}

impl ColumnType {
    fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            ColumnType::String => value.is_string(),
            ColumnType::Int => value.is_i64() || value.is_u64(),
            ColumnType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            ColumnType::Bool => value.is_boolean(),
            ColumnType::Timestamp => value.is_u64() || value.is_i64(),
            ColumnType::Json => true,
        }
    }

    /// Whether key parts of this type can be represented.
    fn is_key_type(&self) -> bool {
        !matches!(self, ColumnType::Float | ColumnType::Json)
    }

    fn accepts_key(&self, part: &KeyValue) -> bool {
        matches!(
            (self, part),
            (ColumnType::String, KeyValue::Text(_))
                | (ColumnType::Int | ColumnType::Timestamp, KeyValue::Int(_))
                | (ColumnType::Bool, KeyValue::Bool(_))
        )
    }
}

/// Definition of a column in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: ColumnName,
    pub column_type: ColumnType,
    pub is_primary_key: bool,
    /// Whether synchronization may write this column.
    pub is_mutable: bool,
    /// Value assigned by the store (identity column).
    pub is_auto_increment: bool,
}

impl Column {
    /// A primary-key column.
    pub fn key(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_primary_key: true,
            is_mutable: false,
            is_auto_increment: false,
        }
    }

    /// A regular column written by synchronization.
    pub fn mutable(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_primary_key: false,
            is_mutable: true,
            is_auto_increment: false,
        }
    }

    /// A column synchronization never writes (computed or store-managed).
    pub fn read_only(name: impl Into<ColumnName>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_primary_key: false,
            is_mutable: false,
            is_auto_increment: false,
        }
    }

    /// Mark the column as auto-increment.
    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }
}

/// Schema for a synchronized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    name: TableName,
    columns: Vec<Column>,
    filter: Option<RowFilter>,
    column_change_tracking: bool,
}

impl TableSchema {
    /// Build a table schema, failing fast on malformed definitions.
    pub fn new(name: impl Into<TableName>, columns: Vec<Column>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::schema(name, "table name is empty"));
        }

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(Error::schema(
                    name,
                    format!("duplicate column '{}'", column.name),
                ));
            }
            if column.is_primary_key && column.is_mutable {
                return Err(Error::schema(
                    name,
                    format!("primary key column '{}' cannot be mutable", column.name),
                ));
            }
            if column.is_primary_key && !column.column_type.is_key_type() {
                return Err(Error::schema(
                    name,
                    format!(
                        "primary key column '{}' cannot have type {}",
                        column.name, column.column_type
                    ),
                ));
            }
        }

        if !columns.iter().any(|c| c.is_primary_key) {
            return Err(Error::schema(name, "no primary key columns"));
        }

        Ok(Self {
            name,
            columns,
            filter: None,
            column_change_tracking: false,
        })
    }

    /// Restrict the table to rows matching `filter`.
    pub fn with_filter(mut self, filter: RowFilter) -> Result<Self> {
        for column in filter.columns() {
            if self.column(column).is_none() {
                return Err(Error::schema(
                    self.name.clone(),
                    format!("filter references unknown column '{column}'"),
                ));
            }
        }
        self.filter = Some(filter);
        Ok(self)
    }

    /// Declare whether the backend records per-column change masks.
    pub fn with_column_change_tracking(mut self, enabled: bool) -> Self {
        self.column_change_tracking = enabled;
        self
    }

    pub fn name(&self) -> &TableName {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn filter(&self) -> Option<&RowFilter> {
        self.filter.as_ref()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary-key columns in schema order.
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.is_primary_key).collect()
    }

    /// Columns synchronization writes. Auto-increment columns are left to
    /// the store unless `include_auto_increment` is set.
    pub fn mutable_columns(&self, include_auto_increment: bool) -> Vec<&Column> {
        self.columns
            .iter()
            .filter(|c| c.is_mutable && !c.is_primary_key)
            .filter(|c| include_auto_increment || !c.is_auto_increment)
            .collect()
    }

    pub fn has_column_change_tracking(&self) -> bool {
        self.column_change_tracking
    }

    fn is_writable(&self, column: &Column) -> bool {
        column.is_mutable && !column.is_primary_key
    }

    /// Extract the primary key from a full row.
    pub fn key_of(&self, row: &Row) -> Result<PrimaryKey> {
        let mut parts = Vec::new();
        for column in self.primary_key_columns() {
            let value = row.get(&column.name).ok_or_else(|| {
                Error::invalid_change(
                    self.name.clone(),
                    format!("missing primary key column '{}'", column.name),
                )
            })?;
            let part = KeyValue::from_json(value).ok_or_else(|| {
                Error::invalid_change(
                    self.name.clone(),
                    format!("primary key column '{}' is not a scalar", column.name),
                )
            })?;
            parts.push(part);
        }
        let key = PrimaryKey::new(parts);
        self.validate_key(&key)?;
        Ok(key)
    }

    /// Check a key has one part per primary-key column, each of the
    /// column's type.
    pub fn validate_key(&self, key: &PrimaryKey) -> Result<()> {
        let columns = self.primary_key_columns();
        if key.len() != columns.len() {
            return Err(Error::invalid_change(
                self.name.clone(),
                format!(
                    "primary key {key} has {} parts, expected {}",
                    key.len(),
                    columns.len()
                ),
            ));
        }
        for (column, part) in columns.iter().zip(key.parts()) {
            if !column.column_type.accepts_key(part) {
                return Err(Error::invalid_change(
                    self.name.clone(),
                    format!(
                        "primary key column '{}' expects {}, got {part}",
                        column.name, column.column_type
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Validate the column values carried by an incoming change.
    ///
    /// Every column must exist, be writable by synchronization and hold a
    /// value of its declared type. Null is accepted for any column.
    pub fn validate_values(&self, values: &Row) -> Result<()> {
        for (name, value) in values {
            let column = self.column(name).ok_or_else(|| {
                Error::invalid_change(self.name.clone(), format!("unknown column '{name}'"))
            })?;

            if !self.is_writable(column) {
                return Err(Error::invalid_change(
                    self.name.clone(),
                    format!("column '{name}' is not mutable"),
                ));
            }

            if !value.is_null() && !column.column_type.accepts(value) {
                return Err(Error::invalid_change(
                    self.name.clone(),
                    format!(
                        "type mismatch for column '{name}': expected {}",
                        column.column_type
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Build the full row for a key and its column values.
    pub fn compose_row(&self, key: &PrimaryKey, values: &Row) -> Row {
        let mut row = values.clone();
        for (column, part) in self.primary_key_columns().iter().zip(key.parts()) {
            row.insert(column.name.clone(), part.to_json());
        }
        row
    }

    /// The mutable (non auto-increment) column values of a full row.
    pub fn mutable_values(&self, row: &Row) -> Row {
        self.mutable_columns(false)
            .into_iter()
            .map(|c| {
                (
                    c.name.clone(),
                    row.get(&c.name).cloned().unwrap_or(serde_json::Value::Null),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                Column::key("id", ColumnType::Int),
                Column::mutable("name", ColumnType::String),
                Column::mutable("age", ColumnType::Int),
                Column::mutable("seq", ColumnType::Int).auto_increment(),
                Column::read_only("row_version", ColumnType::Int),
            ],
        )
        .unwrap()
    }

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn table_without_primary_key_is_rejected() {
        let result = TableSchema::new("logs", vec![Column::mutable("msg", ColumnType::String)]);
        assert!(
            matches!(result, Err(Error::Schema { reason, .. }) if reason.contains("primary key"))
        );
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let result = TableSchema::new(
            "t",
            vec![
                Column::key("id", ColumnType::Int),
                Column::mutable("id", ColumnType::Int),
            ],
        );
        assert!(matches!(result, Err(Error::Schema { .. })));
    }

    #[test]
    fn mutable_primary_key_is_rejected() {
        let mut key = Column::key("id", ColumnType::Int);
        key.is_mutable = true;
        assert!(TableSchema::new("t", vec![key]).is_err());
    }

    #[test]
    fn unrepresentable_key_types_are_rejected() {
        for column_type in [ColumnType::Float, ColumnType::Json] {
            let result = TableSchema::new("t", vec![Column::key("id", column_type)]);
            assert!(matches!(result, Err(Error::Schema { .. })));
        }
        assert!(TableSchema::new("t", vec![Column::key("id", ColumnType::String)]).is_ok());
    }

    #[test]
    fn key_parts_must_match_column_types() {
        let schema = users();
        assert!(schema.validate_key(&PrimaryKey::single(1)).is_ok());

        let err = schema.validate_key(&PrimaryKey::single("1")).unwrap_err();
        assert!(
            matches!(err, Error::InvalidChange { reason, .. } if reason.contains("expects Int"))
        );
        assert!(schema.key_of(&row(json!({"id": true}))).is_err());
    }

    #[test]
    fn filter_must_reference_known_columns() {
        let result = users().with_filter(RowFilter::eq("region", "eu"));
        assert!(
            matches!(result, Err(Error::Schema { reason, .. }) if reason.contains("region"))
        );

        assert!(users().with_filter(RowFilter::gt("age", 18)).is_ok());
    }

    #[test]
    fn column_accessors() {
        let schema = users();
        let names = |columns: Vec<&Column>| -> Vec<String> {
            columns.iter().map(|c| c.name.clone()).collect()
        };
        assert_eq!(names(schema.primary_key_columns()), vec!["id"]);
        assert_eq!(names(schema.mutable_columns(false)), vec!["name", "age"]);
        assert_eq!(names(schema.mutable_columns(true)), vec!["name", "age", "seq"]);

        assert!(!schema.has_column_change_tracking());
        assert!(schema.with_column_change_tracking(true).has_column_change_tracking());
    }

    #[test]
    fn key_extraction() {
        let schema = users();
        let key = schema.key_of(&row(json!({"id": 4, "name": "x"}))).unwrap();
        assert_eq!(key, PrimaryKey::single(4));

        assert!(schema.key_of(&row(json!({"name": "x"}))).is_err());
        assert!(schema.key_of(&row(json!({"id": null}))).is_err());
    }

    #[test]
    fn validate_values() {
        let schema = users();
        assert!(schema
            .validate_values(&row(json!({"name": "Alice", "age": 30})))
            .is_ok());
        assert!(schema.validate_values(&row(json!({"name": null}))).is_ok());

        let reason_of = |err: Error| match err {
            Error::InvalidChange { reason, .. } => reason,
            other => panic!("unexpected error {other:?}"),
        };

        let err = schema.validate_values(&row(json!({"age": "thirty"}))).unwrap_err();
        assert!(reason_of(err).contains("type mismatch"));

        let err = schema.validate_values(&row(json!({"row_version": 3}))).unwrap_err();
        assert!(reason_of(err).contains("not mutable"));

        let err = schema.validate_values(&row(json!({"id": 3}))).unwrap_err();
        assert!(matches!(err, Error::InvalidChange { .. }));

        let err = schema.validate_values(&row(json!({"email": "a@b"}))).unwrap_err();
        assert!(reason_of(err).contains("unknown"));
    }

    #[test]
    fn compose_and_split_rows() {
        let schema = users();
        let key = PrimaryKey::single(9);
        let full = schema.compose_row(&key, &row(json!({"name": "Bo"})));
        assert_eq!(full, row(json!({"id": 9, "name": "Bo"})));

        let stored = row(json!({"id": 9, "name": "Bo", "seq": 3, "row_version": 1}));
        let values = schema.mutable_values(&stored);
        assert_eq!(values, row(json!({"name": "Bo", "age": null})));
    }

    #[test]
    fn schema_serialization() {
        let schema = users().with_filter(RowFilter::gt("age", 18)).unwrap();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: TableSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }
}
