//! SQLite source, reading an export of the source schema.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde_json::{Map, Number, Value};

use super::{SourceReader, SourceRow, SourceTable};
use crate::error::Error;

/// Bound parameters per `IN (...)` query.
const IN_CHUNK: usize = 500;

/// Read-only SQLite source.
pub struct SqliteSource {
    conn: Mutex<Connection>,
}

impl SqliteSource {
    /// Open a database file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::Source(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Whether a table exists.
    pub fn has_table(&self, name: &str) -> Result<bool, Error> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn query(&self, sql: &str, params: Vec<SqlValue>, key: &str) -> Result<Vec<SourceRow>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt.query_map(params_from_iter(params), |row| {
            let mut fields = Map::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                let value: SqlValue = row.get(i)?;
                fields.insert(name.clone(), to_json(value));
            }
            Ok(fields)
        })?;

        let mut out = Vec::new();
        for fields in rows {
            out.push(SourceRow::new(key, fields?));
        }
        Ok(out)
    }

    fn filter_clause(table: &SourceTable, params: &mut Vec<SqlValue>) -> Result<String, Error> {
        match &table.filter {
            Some((column, value)) => {
                params.push(to_sql(value));
                Ok(format!(" AND {} = ?{}", ident(column)?, params.len()))
            }
            None => Ok(String::new()),
        }
    }
}

impl SourceReader for SqliteSource {
    fn max_key(&self, table: &SourceTable) -> Result<u64, Error> {
        let mut params = Vec::new();
        let filter = Self::filter_clause(table, &mut params)?;
        let sql = format!(
            "SELECT MAX({key}) FROM {name} WHERE 1 = 1{filter}",
            key = ident(&table.key)?,
            name = ident(&table.name)?,
        );
        let conn = self.conn.lock();
        let max: Option<i64> =
            conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(max.and_then(|m| u64::try_from(m).ok()).unwrap_or(0))
    }

    fn fetch_page(
        &self,
        table: &SourceTable,
        start_after: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, Error> {
        let mut params = vec![
            SqlValue::Integer(clamp(start_after)),
            SqlValue::Integer(clamp(end)),
        ];
        let filter = Self::filter_clause(table, &mut params)?;
        let key = ident(&table.key)?;
        let sql = format!(
            "SELECT * FROM {name} WHERE {key} > ?1 AND {key} <= ?2{filter} ORDER BY {key} LIMIT {limit}",
            name = ident(&table.name)?,
        );
        self.query(&sql, params, &table.key)
    }

    fn fetch_all(&self, table: &SourceTable) -> Result<Vec<SourceRow>, Error> {
        let mut params = Vec::new();
        let filter = Self::filter_clause(table, &mut params)?;
        let sql = format!(
            "SELECT * FROM {name} WHERE 1 = 1{filter} ORDER BY {key}",
            name = ident(&table.name)?,
            key = ident(&table.key)?,
        );
        self.query(&sql, params, &table.key)
    }

    fn fetch_by(
        &self,
        table: &SourceTable,
        column: &str,
        values: &[Value],
    ) -> Result<Vec<SourceRow>, Error> {
        let mut out = Vec::new();
        for chunk in values.chunks(IN_CHUNK) {
            let mut params: Vec<SqlValue> = chunk.iter().map(to_sql).collect();
            let placeholders = (1..=params.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let filter = Self::filter_clause(table, &mut params)?;
            let sql = format!(
                "SELECT * FROM {name} WHERE {column} IN ({placeholders}){filter} ORDER BY {key}",
                name = ident(&table.name)?,
                column = ident(column)?,
                key = ident(&table.key)?,
            );
            out.extend(self.query(&sql, params, &table.key)?);
        }
        out.sort_by_key(|row| row.key);
        Ok(out)
    }

    fn count(&self, table: &SourceTable) -> Result<u64, Error> {
        let mut params = Vec::new();
        let filter = Self::filter_clause(table, &mut params)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {name} WHERE 1 = 1{filter}",
            name = ident(&table.name)?,
        );
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Quote an identifier, rejecting anything but `[A-Za-z0-9_]`.
fn ident(name: &str) -> Result<String, Error> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Source(format!("invalid identifier: {name:?}")));
    }
    Ok(format!("\"{name}\""))
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Number(i.into()),
        SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> SqliteSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE wcf1_user (userID INTEGER PRIMARY KEY, username TEXT, banned INTEGER);
             INSERT INTO wcf1_user VALUES (1, 'admin', 0), (5, 'jane', 1), (8, 'joe', 0);
             CREATE TABLE wcf1_user_to_group (userID INTEGER, groupID INTEGER);
             INSERT INTO wcf1_user_to_group VALUES (1, 4), (5, 3), (5, 6), (8, 3);",
        )
        .unwrap();
        SqliteSource::from_connection(conn)
    }

    #[test]
    fn test_page_and_max() {
        let source = source();
        let table = SourceTable::new("wcf1_user", "userID");
        assert!(source.has_table("wcf1_user").unwrap());
        assert_eq!(source.max_key(&table).unwrap(), 8);

        let page = source.fetch_page(&table, 1, 8, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key, 5);
        assert_eq!(page[0].str("username"), "jane");
        assert!(page[0].bool("banned"));
    }

    #[test]
    fn test_fetch_by_with_filter() {
        let source = source();
        let table = SourceTable::new("wcf1_user_to_group", "userID");
        let rows = source
            .fetch_by(&table, "userID", &[json!(5), json!(8)])
            .unwrap();
        assert_eq!(rows.len(), 3);

        let filtered = table.filtered("groupID", 3);
        assert_eq!(source.count(&filtered).unwrap(), 2);
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let source = source();
        let table = SourceTable::new("wcf1_user; DROP TABLE x", "userID");
        assert!(matches!(source.max_key(&table), Err(Error::Source(_))));
    }
}
