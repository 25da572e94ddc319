//! SQLite table sink

use async_trait::async_trait;
use opendata_core::validation::{validate_column_key, validate_table_name};
use opendata_core::{Row, RowBatch, RowSink, SinkError};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value;
use std::path::Path;

/// What to do with an existing table of the same name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMode {
    /// Drop and recreate the table
    Replace,
    /// Keep existing rows and insert after them
    Append,
}

/// Inserts batches into one table of a SQLite database.
///
/// The table is created from the first row's keys; columns are untyped so
/// SQLite keeps the JSON value's storage class. Each batch is one transaction.
pub struct SqliteTableSink {
    conn: Option<Connection>,
    table: String,
    columns: Option<Vec<String>>,
    rows_written: u64,
}

impl SqliteTableSink {
    pub fn open<P: AsRef<Path>>(path: P, table: &str, mode: TableMode) -> Result<Self, SinkError> {
        validate_table_name(table).map_err(|e| SinkError::Rejected(e.to_string()))?;

        let conn = Connection::open(path.as_ref())?;
        let columns = match mode {
            TableMode::Replace => {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", table))?;
                None
            }
            TableMode::Append => existing_columns(&conn, table)?,
        };
        tracing::debug!(
            path = %path.as_ref().display(),
            table,
            mode = ?mode,
            existing_columns = columns.as_ref().map_or(0, Vec::len),
            "Opened SQLite table sink"
        );

        Ok(Self {
            conn: Some(conn),
            table: table.to_string(),
            columns,
            rows_written: 0,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

#[async_trait]
impl RowSink for SqliteTableSink {
    async fn accept(&mut self, batch: RowBatch) -> Result<(), SinkError> {
        if batch.rows.is_empty() {
            return Ok(());
        }

        let create = self.columns.is_none();
        let columns = match &self.columns {
            Some(columns) => columns.clone(),
            None => {
                let columns: Vec<String> = batch.rows[0].keys().cloned().collect();
                for column in &columns {
                    validate_column_key(column).map_err(|e| SinkError::Rejected(e.to_string()))?;
                }
                columns
            }
        };
        let table = self.table.clone();
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| SinkError::Rejected("SQLite sink is closed".to_string()))?;

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = insert_batch(&mut conn, &table, &columns, create, &batch.rows)
                .map(|n| (n, columns));
            (conn, result)
        })
        .await
        .map_err(|e| SinkError::Rejected(format!("Task join error: {}", e)))?;

        self.conn = Some(conn);
        let (inserted, columns) = result?;
        if create {
            tracing::debug!(table = %self.table, columns = columns.len(), "Created export table");
        }
        self.columns = Some(columns);
        self.rows_written += inserted;
        tracing::debug!(
            table = %self.table,
            rows = inserted,
            total = self.rows_written,
            "SQLite batch inserted"
        );
        Ok(())
    }
}

fn existing_columns(conn: &Connection, table: &str) -> Result<Option<Vec<String>>, SinkError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(if columns.is_empty() { None } else { Some(columns) })
}

fn insert_batch(
    conn: &mut Connection,
    table: &str,
    columns: &[String],
    create: bool,
    rows: &[Row],
) -> Result<u64, SinkError> {
    let tx = conn.transaction()?;
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c)).collect();

    if create {
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            table,
            quoted.join(", ")
        ))?;
    }

    {
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            table,
            quoted.join(", "),
            placeholders.join(", ")
        ))?;

        for row in rows {
            if let Some(extra) = row.keys().find(|k| !columns.contains(k)) {
                return Err(SinkError::Rejected(format!(
                    "Column '{}' does not exist in table '{}'",
                    extra, table
                )));
            }
            let values = columns.iter().map(|c| to_sql_value(row.get(c)));
            stmt.execute(rusqlite::params_from_iter(values))?;
        }
    }

    tx.commit()?;
    Ok(rows.len() as u64)
}

fn to_sql_value(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn batch(sequence: u64, rows: Vec<Value>) -> RowBatch {
        RowBatch {
            dataset_id: "85313NED".into(),
            sequence,
            start: 0,
            rows: rows
                .into_iter()
                .map(|v| v.as_object().cloned().unwrap())
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_creates_table_and_inserts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.db");

        let mut sink = SqliteTableSink::open(&path, "bevolking", TableMode::Replace).unwrap();
        sink.accept(batch(
            0,
            vec![
                json!({"RegioS": "NL01", "Bevolking_1": 17811291, "Dichtheid": 523.5}),
                json!({"RegioS": "GM0363", "Bevolking_1": null, "Dichtheid": 5277.0}),
            ],
        ))
        .await
        .unwrap();
        sink.finish().await.unwrap();
        assert_eq!(sink.rows_written(), 2);
        drop(sink);

        let conn = Connection::open(&path).unwrap();
        let (regio, count): (String, i64) = conn
            .query_row(
                "SELECT RegioS, Bevolking_1 FROM bevolking WHERE RegioS = 'NL01'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(regio, "NL01");
        assert_eq!(count, 17811291);
        let nulls: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM bevolking WHERE Bevolking_1 IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(nulls, 1);
    }

    #[tokio::test]
    async fn test_append_keeps_rows_and_replace_drops_them() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.db");

        let mut first = SqliteTableSink::open(&path, "t", TableMode::Replace).unwrap();
        first.accept(batch(0, vec![json!({"A": 1})])).await.unwrap();
        drop(first);

        let mut second = SqliteTableSink::open(&path, "t", TableMode::Append).unwrap();
        second.accept(batch(1, vec![json!({"A": 2})])).await.unwrap();
        drop(second);

        let count = |path: &Path| -> i64 {
            Connection::open(path)
                .unwrap()
                .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count(&path), 2);

        let mut third = SqliteTableSink::open(&path, "t", TableMode::Replace).unwrap();
        third.accept(batch(0, vec![json!({"A": 9})])).await.unwrap();
        drop(third);
        assert_eq!(count(&path), 1);
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let dir = TempDir::new().unwrap();
        let result = SqliteTableSink::open(dir.path().join("x.db"), "t; DROP", TableMode::Replace);
        assert!(matches!(result, Err(SinkError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_rejects_bad_column_key() {
        let dir = TempDir::new().unwrap();
        let mut sink =
            SqliteTableSink::open(dir.path().join("x.db"), "t", TableMode::Replace).unwrap();
        let err = sink
            .accept(batch(0, vec![json!({"bad key\"": 1})]))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Rejected(_)));
    }
}
