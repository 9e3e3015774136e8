//! In-memory source, used by tests and dry runs.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::{loose_eq, SourceReader, SourceRow, SourceTable};
use crate::error::Error;

/// Source tables held in memory.
#[derive(Default)]
pub struct MemorySource {
    tables: RwLock<HashMap<String, Vec<Map<String, Value>>>>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row. Non-object values are ignored.
    pub fn insert(&self, table: &str, row: Value) {
        if let Value::Object(fields) = row {
            self.tables
                .write()
                .entry(table.to_string())
                .or_default()
                .push(fields);
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_rows(self, table: &str, rows: impl IntoIterator<Item = Value>) -> Self {
        for row in rows {
            self.insert(table, row);
        }
        self
    }

    fn select<F>(&self, table: &SourceTable, keep: F) -> Vec<SourceRow>
    where
        F: Fn(&SourceRow) -> bool,
    {
        let tables = self.tables.read();
        let mut rows: Vec<SourceRow> = tables
            .get(&table.name)
            .map(|rows| {
                rows.iter()
                    .filter(|fields| table.matches(fields))
                    .map(|fields| SourceRow::new(&table.key, fields.clone()))
                    .filter(|row| keep(row))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|row| row.key);
        rows
    }
}

impl SourceReader for MemorySource {
    fn max_key(&self, table: &SourceTable) -> Result<u64, Error> {
        Ok(self
            .select(table, |_| true)
            .last()
            .map(|row| row.key)
            .unwrap_or(0))
    }

    fn fetch_page(
        &self,
        table: &SourceTable,
        start_after: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, Error> {
        let mut rows = self.select(table, |row| row.key > start_after && row.key <= end);
        rows.truncate(limit);
        Ok(rows)
    }

    fn fetch_all(&self, table: &SourceTable) -> Result<Vec<SourceRow>, Error> {
        Ok(self.select(table, |_| true))
    }

    fn fetch_by(
        &self,
        table: &SourceTable,
        column: &str,
        values: &[Value],
    ) -> Result<Vec<SourceRow>, Error> {
        Ok(self.select(table, |row| {
            row.fields
                .get(column)
                .is_some_and(|v| values.iter().any(|wanted| loose_eq(v, wanted)))
        }))
    }
}
