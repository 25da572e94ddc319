//! The remote statistics service as seen by the catalog, resolver, estimator
//! and fetch engine.

use crate::error::Result;
use crate::query::QueryParams;
use crate::types::{CatalogTableRecord, DownloadPackage, EndpointRecord};
use async_trait::async_trait;
use opendata_core::Row;
use serde_json::Value;
use std::sync::Arc;

/// One `$top`/`$skip` window of a row query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub top: u64,
    pub skip: u64,
    /// Ask the service to report the total row count
    pub inline_count: bool,
}

/// Rows returned for a [`PageRequest`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<Row>,
    /// Total rows matching the query, when the service reported it
    pub total: Option<u64>,
}

/// Remote catalog and data service.
///
/// Metadata calls return the raw `value` items so the resolver can report
/// exactly which field of which item it could not interpret.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Every row of the catalog `Tables` collection
    async fn list_catalog(&self) -> Result<Vec<CatalogTableRecord>>;

    /// Service document of a dataset (its endpoint names)
    async fn dataset_endpoints(&self, dataset_id: &str) -> Result<Vec<EndpointRecord>>;

    /// `DataProperties` items of a dataset
    async fn data_properties(&self, dataset_id: &str) -> Result<Vec<Value>>;

    /// Items of one dimension endpoint
    async fn dimension_values(&self, dataset_id: &str, dimension: &str) -> Result<Vec<Value>>;

    /// `TableInfos` items of a dataset
    async fn table_infos(&self, dataset_id: &str) -> Result<Vec<Value>>;

    /// Package of the open-data portal with this id; `None` when the
    /// portal does not know it
    async fn package(&self, dataset_id: &str) -> Result<Option<DownloadPackage>>;

    /// One page of `TypedDataSet` rows. Not retried by the implementation;
    /// callers own the retry policy for row pages.
    async fn query_page(&self, query: &QueryParams, page: PageRequest) -> Result<Page>;
}

pub type SharedUpstream = Arc<dyn Upstream>;
