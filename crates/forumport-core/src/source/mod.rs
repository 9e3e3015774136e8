//! Source data access.
//!
//! Steps read the source system through [`SourceReader`], which exposes
//! ordinal-ranged pages, full scans of small tables and keyed child lookups.
//! Rows are untyped JSON maps with lenient accessors that coerce the way the
//! source database stores values (numeric strings, `0`/`1` flags).

mod memory;
mod sqlite;

pub use memory::MemorySource;
pub use sqlite::SqliteSource;

use serde_json::{Map, Value};

use crate::error::Error;

/// A source table with its ordinal column and an optional equality filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTable {
    /// Table name, including any prefix.
    pub name: String,
    /// Ordinal column used for cursors and ordering.
    pub key: String,
    /// Optional `column = value` restriction.
    pub filter: Option<(String, Value)>,
}

impl SourceTable {
    /// Create a table reference.
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            filter: None,
        }
    }

    /// Restrict rows to `column = value`.
    pub fn filtered(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = Some((column.into(), value.into()));
        self
    }

    pub(crate) fn matches(&self, fields: &Map<String, Value>) -> bool {
        match &self.filter {
            Some((column, expected)) => fields
                .get(column)
                .is_some_and(|value| loose_eq(value, expected)),
            None => true,
        }
    }
}

/// A row read from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// Value of the table's ordinal column.
    pub key: u64,
    /// All columns.
    pub fields: Map<String, Value>,
}

impl SourceRow {
    /// Build a row, reading the ordinal from `key_column`.
    pub fn new(key_column: &str, fields: Map<String, Value>) -> Self {
        let key = fields.get(key_column).and_then(as_u64).unwrap_or(0);
        Self { key, fields }
    }

    /// Raw column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column).filter(|v| !v.is_null())
    }

    /// Unsigned integer column; `0` when absent or not numeric.
    pub fn u64(&self, column: &str) -> u64 {
        self.get(column).and_then(as_u64).unwrap_or(0)
    }

    /// Signed integer column; `0` when absent or not numeric.
    pub fn i64(&self, column: &str) -> i64 {
        self.get(column).and_then(as_i64).unwrap_or(0)
    }

    /// Text column; empty when absent.
    pub fn str(&self, column: &str) -> &str {
        self.get(column).and_then(Value::as_str).unwrap_or("")
    }

    /// Text column rendered from any scalar; empty when absent.
    pub fn string(&self, column: &str) -> String {
        match self.get(column) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => u8::from(*b).to_string(),
            _ => String::new(),
        }
    }

    /// Flag column: non-zero numbers, `true` and non-empty strings other than `"0"`.
    pub fn bool(&self, column: &str) -> bool {
        match self.get(column) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty() && s != "0",
            _ => false,
        }
    }

    /// Whether the column is present and not null.
    pub fn has(&self, column: &str) -> bool {
        self.get(column).is_some()
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(u64::from(*b)),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Equality that treats `"3"` and `3` as the same value.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_i64(a), as_i64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => x == y,
            _ => false,
        },
    }
}

/// Read access to the source system.
pub trait SourceReader: Send + Sync {
    /// Highest ordinal in the table, `0` when empty.
    fn max_key(&self, table: &SourceTable) -> Result<u64, Error>;

    /// Rows with `start_after < key <= end`, ascending by key, at most `limit`.
    fn fetch_page(
        &self,
        table: &SourceTable,
        start_after: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, Error>;

    /// Every row of the table, ascending by key.
    fn fetch_all(&self, table: &SourceTable) -> Result<Vec<SourceRow>, Error>;

    /// Rows whose `column` equals any of `values`, ascending by key.
    fn fetch_by(
        &self,
        table: &SourceTable,
        column: &str,
        values: &[Value],
    ) -> Result<Vec<SourceRow>, Error>;

    /// Number of rows, honouring the table filter.
    fn count(&self, table: &SourceTable) -> Result<u64, Error> {
        Ok(self.fetch_all(table)?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> SourceRow {
        match value {
            Value::Object(map) => SourceRow::new("id", map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_lenient_accessors() {
        let r = row(json!({
            "id": "12",
            "count": 5,
            "negative": -3,
            "name": "Jane",
            "flag": "1",
            "off": 0,
            "none": null
        }));
        assert_eq!(r.key, 12);
        assert_eq!(r.u64("count"), 5);
        assert_eq!(r.u64("name"), 0);
        assert_eq!(r.i64("negative"), -3);
        assert_eq!(r.str("name"), "Jane");
        assert_eq!(r.str("missing"), "");
        assert_eq!(r.string("count"), "5");
        assert!(r.bool("flag"));
        assert!(!r.bool("off"));
        assert!(!r.has("none"));
    }

    #[test]
    fn test_filter_matches_loosely() {
        let table = SourceTable::new("watch", "watchID").filtered("objectTypeID", 7);
        let r = row(json!({ "id": 1, "objectTypeID": "7" }));
        assert!(table.matches(&r.fields));
        let r = row(json!({ "id": 1, "objectTypeID": 8 }));
        assert!(!table.matches(&r.fields));
    }
}
