//! Wire types of the OData v3 catalog and data services, and their
//! conversion into domain types.

use chrono::{DateTime, Utc};
use opendata_core::{
    CatalogError, ColumnDefinition, ColumnKind, DatasetDescriptor, DatasetStatus,
    DimensionVocabulary, SourceOrigin, VocabularyEntry,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Endpoints every dataset exposes besides its dimension endpoints
pub const STANDARD_ENDPOINTS: &[&str] = &[
    "TableInfos",
    "UntypedDataSet",
    "TypedDataSet",
    "DataProperties",
    "CategoryGroups",
];

/// OData JSON collection: `{"odata.metadata": ..., "value": [...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct ODataCollection<T> {
    pub value: Vec<T>,
    /// Present when `$inlinecount=allpages` was requested
    #[serde(rename = "odata.count", default, deserialize_with = "deserialize_count")]
    pub count: Option<u64>,
}

/// The service reports `odata.count` as a JSON string; accept numbers too.
fn deserialize_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(u64),
        Text(String),
    }

    match Option::<Count>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Count::Number(n)) => Ok(Some(n)),
        Some(Count::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Row of the catalog `Tables` collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogTableRecord {
    pub identifier: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    /// "Regulier" or "Gediscontinueerd"
    pub output_status: Option<String>,
    /// Publishing catalog, "CBS" for the office's own tables
    pub catalog: Option<String>,
    pub record_count: Option<i64>,
    pub column_count: Option<i64>,
    pub modified: Option<String>,
}

impl CatalogTableRecord {
    pub fn into_descriptor(self, refreshed_at: DateTime<Utc>) -> Result<DatasetDescriptor, CatalogError> {
        let identifier = self
            .identifier
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| CatalogError::SchemaError {
                dataset_id: "catalog".to_string(),
                field: "Identifier".to_string(),
            })?;
        let title = self.title.ok_or_else(|| CatalogError::SchemaError {
            dataset_id: identifier.clone(),
            field: "Title".to_string(),
        })?;

        let status = match self.output_status.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("Gediscontinueerd") => DatasetStatus::Discontinued,
            _ => DatasetStatus::Active,
        };
        let source = match self.catalog.as_deref() {
            None => SourceOrigin::Cbs,
            Some(c) if c.eq_ignore_ascii_case("CBS") => SourceOrigin::Cbs,
            Some(_) => SourceOrigin::CbsPartner,
        };

        Ok(DatasetDescriptor {
            identifier: identifier.trim().to_string(),
            title,
            summary: self.summary.unwrap_or_default(),
            source,
            status,
            record_count: self.record_count,
            column_count: self.column_count,
            modified: self.modified,
            last_refreshed: refreshed_at,
        })
    }
}

/// Row of a dataset's service document: `{ "name": ..., "url": ... }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub name: String,
    pub url: String,
}

/// Metadata endpoints of one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEndpoints {
    pub dataset_id: String,
    pub standard: Vec<EndpointRecord>,
    pub dimensions: Vec<EndpointRecord>,
}

impl DatasetEndpoints {
    pub fn from_records(dataset_id: &str, records: Vec<EndpointRecord>) -> Self {
        let (standard, dimensions) = records
            .into_iter()
            .partition(|r| STANDARD_ENDPOINTS.contains(&r.name.as_str()));
        Self {
            dataset_id: dataset_id.to_string(),
            standard,
            dimensions,
        }
    }
}

/// `package_show` response of the open-data portal: `{"success": ..., "result": {...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct PackageResponse {
    #[serde(default)]
    pub success: bool,
    pub result: Option<DownloadPackage>,
}

/// A dataset the open-data portal publishes as downloadable files only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadPackage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub notes: Option<String>,
    #[serde(default)]
    pub resources: Vec<PackageResource>,
}

impl DownloadPackage {
    /// Distinct file formats of the resources, in order of appearance
    pub fn formats(&self) -> Vec<&str> {
        let mut formats: Vec<&str> = Vec::new();
        for format in self.resources.iter().filter_map(|r| r.format.as_deref()) {
            let format = format.trim();
            if !format.is_empty() && !formats.contains(&format) {
                formats.push(format);
            }
        }
        formats
    }
}

/// One downloadable file of a [`DownloadPackage`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResource {
    pub name: Option<String>,
    pub format: Option<String>,
    pub url: Option<String>,
}

/// Free-form TableInfos record of one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub dataset_id: String,
    pub fields: serde_json::Map<String, Value>,
}

impl DatasetInfo {
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

fn text<'a>(item: &'a Value, field: &str) -> Option<&'a str> {
    item.get(field).and_then(Value::as_str)
}

fn optional_text(item: &Value, field: &str) -> Option<String> {
    text(item, field)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse a `DataProperties` collection into column definitions.
///
/// Topic groups are presentation-only and skipped. Geo dimensions are
/// dimensions; geo details are measured values.
pub fn parse_data_properties(
    dataset_id: &str,
    items: &[Value],
) -> Result<Vec<ColumnDefinition>, CatalogError> {
    let missing = |position: usize, field: &str| CatalogError::SchemaError {
        dataset_id: dataset_id.to_string(),
        field: format!("DataProperties[{}].{}", position, field),
    };

    let mut columns = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let kind_name = text(item, "Type").ok_or_else(|| missing(position, "Type"))?;
        let kind = match kind_name {
            "TopicGroup" => continue,
            "Dimension" | "GeoDimension" => ColumnKind::Dimension,
            "TimeDimension" => ColumnKind::TimeDimension,
            "Topic" | "GeoDetail" => ColumnKind::Topic,
            other => {
                return Err(CatalogError::SchemaError {
                    dataset_id: dataset_id.to_string(),
                    field: format!("DataProperties[{}].Type '{}' is not a known column type", position, other),
                })
            }
        };
        let key = optional_text(item, "Key").ok_or_else(|| missing(position, "Key"))?;
        let title = text(item, "Title").ok_or_else(|| missing(position, "Title"))?;

        columns.push(ColumnDefinition {
            vocabulary: kind.is_dimension().then(|| key.clone()),
            key,
            kind,
            title: title.to_string(),
            description: optional_text(item, "Description"),
            unit: optional_text(item, "Unit"),
            data_type: optional_text(item, "Datatype"),
        });
    }
    Ok(columns)
}

/// Parse a dimension endpoint collection (`Key`, `Title`, `Description`).
pub fn parse_vocabulary(
    dataset_id: &str,
    dimension: &str,
    items: &[Value],
) -> Result<DimensionVocabulary, CatalogError> {
    let mut entries = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let field = |name: &str| CatalogError::SchemaError {
            dataset_id: dataset_id.to_string(),
            field: format!("{}[{}].{}", dimension, position, name),
        };
        let code = text(item, "Key").ok_or_else(|| field("Key"))?;
        let label = text(item, "Title").ok_or_else(|| field("Title"))?;
        entries.push(VocabularyEntry {
            code: code.to_string(),
            label: label.to_string(),
            description: optional_text(item, "Description"),
        });
    }
    DimensionVocabulary::new(dataset_id, dimension, entries)
}
