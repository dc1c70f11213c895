//! Row filter predicates.
//!
//! A filter restricts the rows a table exposes to synchronization. It is
//! plain data so that a backend can translate it into its own query
//! language; [`RowFilter::matches`] evaluates it directly against a row.

use crate::{ColumnName, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// A predicate over the columns of a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RowFilter {
    Eq { column: ColumnName, value: Value },
    Ne { column: ColumnName, value: Value },
    Lt { column: ColumnName, value: Value },
    Gt { column: ColumnName, value: Value },
    In { column: ColumnName, values: Vec<Value> },
    IsNull { column: ColumnName },
    And { filters: Vec<RowFilter> },
    Or { filters: Vec<RowFilter> },
    Not { filter: Box<RowFilter> },
}

impl RowFilter {
    pub fn eq(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        RowFilter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn ne(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        RowFilter::Ne {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn lt(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        RowFilter::Lt {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn gt(column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        RowFilter::Gt {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn is_null(column: impl Into<ColumnName>) -> Self {
        RowFilter::IsNull {
            column: column.into(),
        }
    }

    pub fn and(self, other: RowFilter) -> Self {
        RowFilter::And {
            filters: vec![self, other],
        }
    }

    pub fn or(self, other: RowFilter) -> Self {
        RowFilter::Or {
            filters: vec![self, other],
        }
    }

    pub fn negate(self) -> Self {
        RowFilter::Not {
            filter: Box::new(self),
        }
    }

    /// All column names this filter reads.
    pub fn columns(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            RowFilter::Eq { column, .. }
            | RowFilter::Ne { column, .. }
            | RowFilter::Lt { column, .. }
            | RowFilter::Gt { column, .. }
            | RowFilter::In { column, .. }
            | RowFilter::IsNull { column } => {
                out.insert(column.as_str());
            }
            RowFilter::And { filters } | RowFilter::Or { filters } => {
                for f in filters {
                    f.collect_columns(out);
                }
            }
            RowFilter::Not { filter } => filter.collect_columns(out),
        }
    }

    /// Evaluate the filter against a row. A missing column reads as null.
    pub fn matches(&self, row: &Row) -> bool {
        let get = |column: &str| row.get(column).unwrap_or(&Value::Null);

        match self {
            RowFilter::Eq { column, value } => values_equal(get(column), value),
            RowFilter::Ne { column, value } => !values_equal(get(column), value),
            RowFilter::Lt { column, value } => {
                compare_values(get(column), value) == Some(Ordering::Less)
            }
            RowFilter::Gt { column, value } => {
                compare_values(get(column), value) == Some(Ordering::Greater)
            }
            RowFilter::In { column, values } => {
                let v = get(column);
                values.iter().any(|candidate| values_equal(v, candidate))
            }
            RowFilter::IsNull { column } => get(column).is_null(),
            RowFilter::And { filters } => filters.iter().all(|f| f.matches(row)),
            RowFilter::Or { filters } => filters.iter().any(|f| f.matches(row)),
            RowFilter::Not { filter } => !filter.matches(row),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two scalar values of the same kind. Nulls and mixed
/// kinds are incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn comparison_filters() {
        let r = row(json!({"id": 1, "region": "eu", "score": 7.5}));

        assert!(RowFilter::eq("region", "eu").matches(&r));
        assert!(!RowFilter::eq("region", "us").matches(&r));
        assert!(RowFilter::ne("region", "us").matches(&r));
        assert!(RowFilter::gt("score", 7).matches(&r));
        assert!(RowFilter::lt("id", 2).matches(&r));
        assert!(!RowFilter::lt("region", 2).matches(&r));
    }

    #[test]
    fn integer_and_float_compare_equal() {
        let r = row(json!({"n": 3}));
        assert!(RowFilter::eq("n", 3.0).matches(&r));
    }

    #[test]
    fn missing_column_reads_as_null() {
        let r = row(json!({"id": 1}));
        assert!(RowFilter::is_null("deleted_at").matches(&r));
        assert!(!RowFilter::gt("deleted_at", 0).matches(&r));
    }

    #[test]
    fn boolean_combinators() {
        let r = row(json!({"region": "eu", "active": true}));
        let filter = RowFilter::eq("region", "eu").and(RowFilter::eq("active", true));
        assert!(filter.matches(&r));
        assert!(!filter.clone().negate().matches(&r));

        let either = RowFilter::eq("region", "us").or(RowFilter::eq("active", true));
        assert!(either.matches(&r));

        let in_filter = RowFilter::In {
            column: "region".into(),
            values: vec![json!("us"), json!("eu")],
        };
        assert!(in_filter.matches(&r));
    }

    #[test]
    fn columns_are_collected_from_nested_filters() {
        let filter = RowFilter::eq("a", 1)
            .and(RowFilter::is_null("b").or(RowFilter::gt("c", 2)))
            .negate();
        let columns: Vec<_> = filter.columns().into_iter().collect();
        assert_eq!(columns, vec!["a", "b", "c"]);
    }

    #[test]
    fn serialization_format() {
        let filter = RowFilter::eq("region", "eu");
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"op\":\"eq\""));
        let parsed: RowFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, filter);
    }
}
