//! Open-data catalog storage
//!
//! Local SQLite store for the catalog snapshot, persisted metadata records and
//! the export ledger, plus the CSV and SQLite-table sink adapters.
//!
//! # Safety
//!
//! **CRITICAL**: Never hold a `rusqlite::Connection` across `.await` points.
//! Every store operation opens its own connection inside
//! `tokio::task::spawn_blocking`, which is also what gives readers snapshot
//! isolation while a refresh is writing (WAL journal).

use chrono::{DateTime, Utc};
use opendata_core::{
    init_sqlite_schema, CatalogError, DatasetDescriptor, DatasetStatus, ExportRecord, Result,
    SearchField, SourceOrigin,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod csv_sink;
mod sqlite_sink;

pub use csv_sink::CsvSink;
pub use sqlite_sink::{SqliteTableSink, TableMode};

/// How long a connection waits for another writer before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DESCRIPTOR_COLUMNS: &str = "identifier, title, summary, source, status, record_count, \
                                  column_count, modified, last_refreshed";

/// Kind of a persisted metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Column definitions, keyed by dataset id
    Structure,
    /// Dimension vocabulary, keyed by `dataset_id/dimension`
    Vocabulary,
    /// TableInfos record, keyed by dataset id
    Info,
    /// Endpoint listing, keyed by dataset id
    Endpoints,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Structure => "structure",
            RecordKind::Vocabulary => "vocabulary",
            RecordKind::Info => "info",
            RecordKind::Endpoints => "endpoints",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted metadata record with its refresh time
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord<T> {
    pub value: T,
    pub refreshed_at: DateTime<Utc>,
}

/// State of the catalog snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub count: usize,
    /// `None` until the first refresh
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Row counts of every table in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub datasets: u64,
    pub metadata_records: u64,
    pub exports: u64,
    pub catalog_refreshed_at: Option<DateTime<Utc>>,
}

/// SQLite file on the local filesystem holding all persisted state
#[derive(Clone, Debug)]
pub struct LocalSqliteStore {
    path: PathBuf,
}

impl LocalSqliteStore {
    /// Create a store handle; nothing is opened until the first operation
    ///
    /// # Example
    /// ```no_run
    /// use opendata_storage::LocalSqliteStore;
    ///
    /// let store = LocalSqliteStore::new("opendata.db");
    /// ```
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.path.exists())
    }

    /// Create the database file and schema; a no-op on an existing store
    pub async fn initialize(&self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CatalogError::Other(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
            open_connection(&path)?;
            tracing::debug!(path = %path.display(), "Store initialized");
            Ok(())
        })
        .await
        .map_err(|e| CatalogError::Other(format!("Task join error: {}", e)))?
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| CatalogError::Other(format!("Task join error: {}", e)))?
    }

    // ------------------------------------------------------------------------
    // Catalog snapshot
    // ------------------------------------------------------------------------

    /// Replace the whole catalog snapshot in one transaction.
    ///
    /// Readers see either the previous snapshot or this one. Returns the
    /// number of descriptors stored (duplicate identifiers collapse).
    pub async fn replace_catalog(
        &self,
        descriptors: Vec<DatasetDescriptor>,
        refreshed_at: DateTime<Utc>,
    ) -> Result<usize> {
        let submitted = descriptors.len();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute("DELETE FROM catalog_datasets", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO catalog_datasets
                     (identifier, title, summary, source, status, record_count, column_count,
                      modified, last_refreshed, title_folded, summary_folded)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )?;
                for d in &descriptors {
                    stmt.execute(params![
                        d.identifier,
                        d.title,
                        d.summary,
                        d.source.to_string(),
                        d.status.to_string(),
                        d.record_count,
                        d.column_count,
                        d.modified,
                        d.last_refreshed.to_rfc3339(),
                        fold(&d.title),
                        fold(&d.summary),
                    ])?;
                }
            }
            let count: i64 =
                tx.query_row("SELECT COUNT(*) FROM catalog_datasets", [], |row| row.get(0))?;
            tx.execute(
                "UPDATE store_meta SET catalog_refreshed_at = ?1, catalog_count = ?2 WHERE id = 1",
                params![refreshed_at.to_rfc3339(), count],
            )?;
            tx.commit()?;
            tracing::info!(submitted, stored = count, removed, "Catalog snapshot replaced");
            Ok(count as usize)
        })
        .await
    }

    /// Read one descriptor by primary key
    pub async fn get_descriptor(&self, identifier: &str) -> Result<Option<DatasetDescriptor>> {
        let identifier = identifier.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM catalog_datasets WHERE identifier = ?1",
                DESCRIPTOR_COLUMNS
            );
            let found = conn
                .query_row(&sql, [&identifier], row_to_descriptor)
                .optional()?;
            Ok(found)
        })
        .await
    }

    /// Keyword search over the snapshot.
    ///
    /// A case-insensitive hit of the whole query in the title scores 2, in the
    /// summary 1. Rows scoring 0 are dropped; ties order by identifier.
    pub async fn search_catalog(
        &self,
        query: &str,
        field: SearchField,
        limit: usize,
    ) -> Result<Vec<DatasetDescriptor>> {
        let needle = fold(query);
        self.run(move |conn| {
            let sql = format!(
                "SELECT {cols} FROM (
                     SELECT {cols},
                         (CASE WHEN ?2 AND instr(title_folded, ?1) > 0 THEN 2 ELSE 0 END)
                       + (CASE WHEN ?3 AND instr(summary_folded, ?1) > 0 THEN 1 ELSE 0 END)
                         AS score
                     FROM catalog_datasets
                 )
                 WHERE score > 0
                 ORDER BY score DESC, identifier ASC
                 LIMIT ?4",
                cols = DESCRIPTOR_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![
                        needle,
                        field.includes_title(),
                        field.includes_summary(),
                        limit as i64
                    ],
                    row_to_descriptor,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Page through the snapshot in identifier order
    pub async fn list_catalog(&self, offset: usize, limit: usize) -> Result<Vec<DatasetDescriptor>> {
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM catalog_datasets ORDER BY identifier ASC LIMIT ?1 OFFSET ?2",
                DESCRIPTOR_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], row_to_descriptor)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn snapshot_info(&self) -> Result<SnapshotInfo> {
        self.run(|conn| {
            let (count, refreshed_at): (i64, Option<String>) = conn.query_row(
                "SELECT catalog_count, catalog_refreshed_at FROM store_meta WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(SnapshotInfo {
                count: count as usize,
                refreshed_at: refreshed_at.as_deref().map(parse_timestamp).transpose()?,
            })
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Metadata records
    // ------------------------------------------------------------------------

    /// Insert or replace a metadata record
    pub async fn put_record<T: Serialize>(
        &self,
        kind: RecordKind,
        key: &str,
        value: &T,
        refreshed_at: DateTime<Utc>,
    ) -> Result<()> {
        let payload = serde_json::to_string(value)
            .map_err(|e| CatalogError::SerializationError(e.to_string()))?;
        let key = key.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO metadata_records (kind, key, payload, refreshed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind, key) DO UPDATE SET
                     payload = excluded.payload,
                     refreshed_at = excluded.refreshed_at",
                params![kind.as_str(), key, payload, refreshed_at.to_rfc3339()],
            )?;
            tracing::debug!(kind = %kind, key = %key, bytes = payload.len(), "Metadata record stored");
            Ok(())
        })
        .await
    }

    /// Read a single metadata record
    pub async fn get_record<T>(&self, kind: RecordKind, key: &str) -> Result<Option<StoredRecord<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        self.run(move |conn| {
            let found: Option<(String, String)> = conn
                .query_row(
                    "SELECT payload, refreshed_at FROM metadata_records WHERE kind = ?1 AND key = ?2",
                    params![kind.as_str(), key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match found {
                Some((payload, refreshed_at)) => {
                    let value = serde_json::from_str(&payload).map_err(|e| {
                        tracing::warn!(kind = %kind, key = %key, error = %e, "Corrupt metadata record");
                        CatalogError::SerializationError(format!(
                            "Corrupt {} record '{}': {}",
                            kind, key, e
                        ))
                    })?;
                    Ok(Some(StoredRecord {
                        value,
                        refreshed_at: parse_timestamp(&refreshed_at)?,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Remove a metadata record; returns whether one existed
    pub async fn delete_record(&self, kind: RecordKind, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.run(move |conn| {
            let n = conn.execute(
                "DELETE FROM metadata_records WHERE kind = ?1 AND key = ?2",
                params![kind.as_str(), key],
            )?;
            tracing::debug!(kind = %kind, key = %key, deleted = n > 0, "Metadata record removed");
            Ok(n > 0)
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Export ledger
    // ------------------------------------------------------------------------

    pub async fn record_export(&self, record: ExportRecord) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO exports (path, dataset_id, rows, completed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.path,
                    record.dataset_id,
                    record.rows as i64,
                    record.completed_at.to_rfc3339()
                ],
            )?;
            tracing::info!(
                path = %record.path,
                dataset = %record.dataset_id,
                rows = record.rows,
                "Export recorded"
            );
            Ok(())
        })
        .await
    }

    pub async fn get_export(&self, path: &str) -> Result<Option<ExportRecord>> {
        let path = path.to_string();
        self.run(move |conn| {
            let found: Option<(String, String, i64, String)> = conn
                .query_row(
                    "SELECT path, dataset_id, rows, completed_at FROM exports WHERE path = ?1",
                    [&path],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            found
                .map(|(path, dataset_id, rows, completed_at)| {
                    Ok(ExportRecord {
                        path,
                        dataset_id,
                        rows: rows as u64,
                        completed_at: parse_timestamp(&completed_at)?,
                    })
                })
                .transpose()
        })
        .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.run(|conn| {
            let count = |table: &str| -> Result<u64> {
                let n: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
                Ok(n as u64)
            };
            let refreshed_at: Option<String> = conn.query_row(
                "SELECT catalog_refreshed_at FROM store_meta WHERE id = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(StoreStats {
                datasets: count("catalog_datasets")?,
                metadata_records: count("metadata_records")?,
                exports: count("exports")?,
                catalog_refreshed_at: refreshed_at.as_deref().map(parse_timestamp).transpose()?,
            })
        })
        .await
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    init_sqlite_schema(&conn)?;
    Ok(conn)
}

/// Lowercased text used for case-insensitive matching
fn fold(text: &str) -> String {
    text.to_lowercase()
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CatalogError::SerializationError(format!("Bad timestamp '{}': {}", value, e)))
}

fn row_to_descriptor(row: &rusqlite::Row<'_>) -> rusqlite::Result<DatasetDescriptor> {
    let source: String = row.get(3)?;
    let status: String = row.get(4)?;
    let last_refreshed: String = row.get(8)?;
    Ok(DatasetDescriptor {
        identifier: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        source: source
            .parse::<SourceOrigin>()
            .map_err(|e| conversion_error(3, e))?,
        status: status
            .parse::<DatasetStatus>()
            .map_err(|e| conversion_error(4, e))?,
        record_count: row.get(5)?,
        column_count: row.get(6)?,
        modified: row.get(7)?,
        last_refreshed: parse_timestamp(&last_refreshed).map_err(|e| conversion_error(8, e))?,
    })
}

fn conversion_error(column: usize, err: CatalogError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}
