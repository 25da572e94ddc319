//! Open-data catalog core
//!
//! Domain types, the typed filter tree, input validation, the sink contract
//! and the SQLite schema shared by the storage and client crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod filter;
pub mod sink;
pub mod validation;

pub use filter::{CompareOp, Filter};
pub use sink::{FnSink, RowSink, SinkError};

/// One row of a dataset: column key to JSON value, in upstream column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Catalog entry for a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Opaque, globally unique identifier (e.g. "85313NED")
    pub identifier: String,
    pub title: String,
    pub summary: String,
    pub source: SourceOrigin,
    pub status: DatasetStatus,
    /// Row count advertised by the catalog (hint only)
    pub record_count: Option<i64>,
    /// Column count advertised by the catalog (hint only)
    pub column_count: Option<i64>,
    /// Upstream modification timestamp, as published
    pub modified: Option<String>,
    /// When the refresh cycle that produced this entry ran
    pub last_refreshed: DateTime<Utc>,
}

/// Which catalog published a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    /// The statistics office's own tables
    Cbs,
    /// Third-party tables published through the same catalog
    CbsPartner,
}

impl std::fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceOrigin::Cbs => write!(f, "cbs"),
            SourceOrigin::CbsPartner => write!(f, "cbs_partner"),
        }
    }
}

impl std::str::FromStr for SourceOrigin {
    type Err = CatalogError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cbs" => Ok(SourceOrigin::Cbs),
            "cbs_partner" => Ok(SourceOrigin::CbsPartner),
            _ => Err(CatalogError::ValidationError(format!(
                "Unknown source origin: {}",
                s
            ))),
        }
    }
}

/// Publication status of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Active,
    Discontinued,
}

impl std::fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetStatus::Active => write!(f, "active"),
            DatasetStatus::Discontinued => write!(f, "discontinued"),
        }
    }
}

impl std::str::FromStr for DatasetStatus {
    type Err = CatalogError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(DatasetStatus::Active),
            "discontinued" => Ok(DatasetStatus::Discontinued),
            _ => Err(CatalogError::ValidationError(format!(
                "Unknown dataset status: {}",
                s
            ))),
        }
    }
}

/// Which descriptor text a catalog search matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    Title,
    Summary,
    #[default]
    Both,
}

impl SearchField {
    pub fn includes_title(self) -> bool {
        matches!(self, SearchField::Title | SearchField::Both)
    }

    pub fn includes_summary(self) -> bool {
        matches!(self, SearchField::Summary | SearchField::Both)
    }
}

impl std::fmt::Display for SearchField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchField::Title => write!(f, "title"),
            SearchField::Summary => write!(f, "summary"),
            SearchField::Both => write!(f, "both"),
        }
    }
}

impl std::str::FromStr for SearchField {
    type Err = CatalogError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "title" => Ok(SearchField::Title),
            "summary" => Ok(SearchField::Summary),
            "both" => Ok(SearchField::Both),
            _ => Err(CatalogError::ValidationError(format!(
                "Unknown search field: {} (expected title, summary or both)",
                s
            ))),
        }
    }
}

// ============================================================================
// Dataset structure
// ============================================================================

/// Role a column plays in a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Categorical dimension with a code vocabulary
    Dimension,
    /// Period dimension (e.g. "2023JJ00")
    TimeDimension,
    /// Measured value
    Topic,
}

impl ColumnKind {
    pub fn is_dimension(self) -> bool {
        matches!(self, ColumnKind::Dimension | ColumnKind::TimeDimension)
    }
}

impl std::fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnKind::Dimension => write!(f, "dimension"),
            ColumnKind::TimeDimension => write!(f, "time_dimension"),
            ColumnKind::Topic => write!(f, "topic"),
        }
    }
}

/// One column of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column key as used in filters and row objects
    pub key: String,
    pub kind: ColumnKind,
    /// Human-readable label
    pub title: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub data_type: Option<String>,
    /// Endpoint name of the code vocabulary (dimension kinds only)
    pub vocabulary: Option<String>,
}

/// Ordered column definitions of one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStructure {
    pub dataset_id: String,
    pub columns: Vec<ColumnDefinition>,
}

impl DatasetStructure {
    pub fn column(&self, key: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.key == key)
    }

    pub fn has_column(&self, key: &str) -> bool {
        self.column(key).is_some()
    }

    /// Columns that carry a code vocabulary
    pub fn dimensions(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(|c| c.kind.is_dimension())
    }

    pub fn column_keys(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.key.as_str()).collect()
    }
}

/// A single code of a dimension vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub code: String,
    pub label: String,
    pub description: Option<String>,
}

/// Ordered code to label mapping for one dimension of one dataset.
///
/// Codes are stored trimmed and are unique. Lookups trim the probe as well,
/// so the padded codes the upstream returns in row values resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "VocabularyParts", into = "VocabularyParts")]
pub struct DimensionVocabulary {
    dataset_id: String,
    dimension: String,
    entries: Vec<VocabularyEntry>,
    index: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct VocabularyParts {
    dataset_id: String,
    dimension: String,
    entries: Vec<VocabularyEntry>,
}

impl TryFrom<VocabularyParts> for DimensionVocabulary {
    type Error = CatalogError;

    fn try_from(parts: VocabularyParts) -> Result<Self> {
        DimensionVocabulary::new(parts.dataset_id, parts.dimension, parts.entries)
    }
}

impl From<DimensionVocabulary> for VocabularyParts {
    fn from(v: DimensionVocabulary) -> Self {
        VocabularyParts {
            dataset_id: v.dataset_id,
            dimension: v.dimension,
            entries: v.entries,
        }
    }
}

impl DimensionVocabulary {
    /// Build a vocabulary, trimming codes.
    ///
    /// A repeated code with the same label is collapsed; a repeated code with
    /// a different label is a schema error.
    pub fn new(
        dataset_id: impl Into<String>,
        dimension: impl Into<String>,
        entries: Vec<VocabularyEntry>,
    ) -> Result<Self> {
        let dataset_id = dataset_id.into();
        let dimension = dimension.into();
        let mut kept: Vec<VocabularyEntry> = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());

        for mut entry in entries {
            entry.code = entry.code.trim().to_string();
            if let Some(&pos) = index.get(&entry.code) {
                let existing: &VocabularyEntry = &kept[pos];
                if existing.label != entry.label {
                    return Err(CatalogError::SchemaError {
                        dataset_id,
                        field: format!("{}.Key '{}' has conflicting labels", dimension, entry.code),
                    });
                }
                continue;
            }
            index.insert(entry.code.clone(), kept.len());
            kept.push(entry);
        }

        Ok(Self {
            dataset_id,
            dimension,
            entries: kept,
            index,
        })
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    pub fn entries(&self) -> &[VocabularyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Label for a code, ignoring surrounding whitespace
    pub fn label(&self, code: &str) -> Option<&str> {
        self.index
            .get(code.trim())
            .map(|&pos| self.entries[pos].label.as_str())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.index.contains_key(code.trim())
    }
}

// ============================================================================
// Queries and fetch state
// ============================================================================

/// A structured request for rows of one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub dataset_id: String,
    pub filter: Option<Filter>,
    /// Column keys to return; `None` returns all columns
    pub projection: Option<Vec<String>>,
    /// Maximum number of rows to emit over the whole fetch
    pub row_cap: Option<u64>,
    /// Replace dimension codes with labels before emission
    pub translate: bool,
}

impl QuerySpec {
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            filter: None,
            projection: None,
            row_cap: None,
            translate: false,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_projection<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_row_cap(mut self, cap: u64) -> Self {
        self.row_cap = Some(cap);
        self
    }

    pub fn with_translation(mut self, translate: bool) -> Self {
        self.translate = translate;
        self
    }
}

/// Resumable position of a paginated fetch.
///
/// `offset` counts rows already delivered to the sink, so it is also the
/// `$skip` of the next page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchCursor {
    pub dataset_id: String,
    pub query: QuerySpec,
    pub offset: u64,
    pub total_known: Option<u64>,
    pub completed: bool,
    pub next_sequence: u64,
}

impl FetchCursor {
    pub fn start(query: QuerySpec) -> Self {
        Self {
            dataset_id: query.dataset_id.clone(),
            query,
            offset: 0,
            total_known: None,
            completed: false,
            next_sequence: 0,
        }
    }

    /// Rows still allowed under the row cap, if any
    pub fn remaining_cap(&self) -> Option<u64> {
        self.query
            .row_cap
            .map(|cap| cap.saturating_sub(self.offset))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CatalogError::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CatalogError::SerializationError(e.to_string()))
    }
}

/// Rows of one page, in upstream order
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    pub dataset_id: String,
    pub sequence: u64,
    /// Offset of the first row in the full result
    pub start: u64,
    pub rows: Vec<Row>,
}

impl RowBatch {
    /// Exclusive end of the source offset range
    pub fn end(&self) -> u64 {
        self.start + self.rows.len() as u64
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Entry in the export ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub path: String,
    pub dataset_id: String,
    pub rows: u64,
    pub completed_at: DateTime<Utc>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Unexpected schema for dataset '{dataset_id}': {field}")]
    SchemaError { dataset_id: String, field: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Version of the local store layout
pub const SCHEMA_VERSION: i64 = 1;

/// Create the local store tables.
///
/// Holds the catalog snapshot (one row per descriptor), metadata records keyed
/// by (kind, key) and the export ledger. Safe to call on an existing store.
pub fn init_sqlite_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version INTEGER NOT NULL,
            catalog_refreshed_at TEXT,
            catalog_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS catalog_datasets (
            identifier TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            record_count INTEGER,
            column_count INTEGER,
            modified TEXT,
            last_refreshed TEXT NOT NULL,
            title_folded TEXT NOT NULL,
            summary_folded TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS metadata_records (
            kind TEXT NOT NULL,
            key TEXT NOT NULL,
            payload TEXT NOT NULL,
            refreshed_at TEXT NOT NULL,
            PRIMARY KEY (kind, key)
        );

        CREATE TABLE IF NOT EXISTS exports (
            path TEXT PRIMARY KEY,
            dataset_id TEXT NOT NULL,
            rows INTEGER NOT NULL,
            completed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_exports_dataset ON exports(dataset_id);
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO store_meta (id, schema_version, catalog_count) VALUES (1, ?1, 0)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

/// Schema version recorded in the store
pub fn get_schema_version(conn: &rusqlite::Connection) -> Result<i64> {
    let version = conn.query_row(
        "SELECT schema_version FROM store_meta WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}
