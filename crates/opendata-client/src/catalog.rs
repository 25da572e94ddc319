//! Catalog index over the local snapshot.
//!
//! `refresh` is the only operation that calls the catalog service; search,
//! get and list read the SQLite snapshot.

use crate::backoff::Clock;
use crate::error::{ClientError, Result};
use crate::upstream::Upstream;
use opendata_core::validation::{validate_dataset_id, validate_search_query};
use opendata_core::{DatasetDescriptor, SearchField};
use opendata_storage::{LocalSqliteStore, SnapshotInfo};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Where a dataset id can be found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Present in the local snapshot
    Indexed,
    /// Not in the snapshot, but the data service answers for it
    Queryable,
    /// Unknown to the data service, published as files on the open-data portal
    DownloadOnly,
    Unavailable,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Availability::Indexed => write!(f, "indexed"),
            Availability::Queryable => write!(f, "queryable"),
            Availability::DownloadOnly => write!(f, "download_only"),
            Availability::Unavailable => write!(f, "unavailable"),
        }
    }
}

pub struct CatalogIndex {
    upstream: Arc<dyn Upstream>,
    store: Arc<LocalSqliteStore>,
    clock: Arc<dyn Clock>,
    staleness: Duration,
    refresh_lock: Mutex<()>,
}

impl CatalogIndex {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: Arc<LocalSqliteStore>,
        clock: Arc<dyn Clock>,
        staleness: Duration,
    ) -> Self {
        Self {
            upstream,
            store,
            clock,
            staleness,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Fetch the full catalog and swap it in as the new snapshot.
    ///
    /// Concurrent refreshes run one after another. A record that cannot be
    /// interpreted fails the refresh and leaves the previous snapshot intact.
    pub async fn refresh(&self) -> Result<usize> {
        let _guard = self.refresh_lock.lock().await;
        let started = self.clock.now();

        let records = self.upstream.list_catalog().await?;
        let fetched = records.len();
        let descriptors = records
            .into_iter()
            .map(|record| record.into_descriptor(started))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let stored = self.store.replace_catalog(descriptors, started).await?;
        tracing::info!(
            fetched,
            stored,
            elapsed_ms = (self.clock.now() - started).num_milliseconds(),
            "Catalog refreshed"
        );
        Ok(stored)
    }

    /// Keyword search, most relevant first. Never calls the network.
    pub async fn search(
        &self,
        query: &str,
        field: SearchField,
        limit: usize,
    ) -> Result<Vec<DatasetDescriptor>> {
        let query = validate_search_query(query)?;
        let results = self.store.search_catalog(&query, field, limit).await?;
        tracing::debug!(query = %query, field = %field, hits = results.len(), "Catalog search");
        Ok(results)
    }

    pub async fn get(&self, dataset_id: &str) -> Result<DatasetDescriptor> {
        validate_dataset_id(dataset_id)?;
        self.store
            .get_descriptor(dataset_id)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("Dataset '{}' is not in the catalog", dataset_id)))
    }

    /// Page through the snapshot in identifier order
    pub async fn list(&self, offset: usize, limit: usize) -> Result<Vec<DatasetDescriptor>> {
        Ok(self.store.list_catalog(offset, limit).await?)
    }

    pub async fn snapshot_info(&self) -> Result<SnapshotInfo> {
        Ok(self.store.snapshot_info().await?)
    }

    /// True when the snapshot is empty or older than the staleness threshold
    pub async fn is_stale(&self) -> Result<bool> {
        let info = self.store.snapshot_info().await?;
        let Some(refreshed_at) = info.refreshed_at else {
            return Ok(true);
        };
        if info.count == 0 {
            return Ok(true);
        }
        let age = (self.clock.now() - refreshed_at).to_std().unwrap_or_default();
        Ok(age > self.staleness)
    }

    /// Check the snapshot first, then the data service, then the open-data
    /// portal.
    pub async fn check_availability(&self, dataset_id: &str) -> Result<Availability> {
        validate_dataset_id(dataset_id)?;
        if self.store.get_descriptor(dataset_id).await?.is_some() {
            return Ok(Availability::Indexed);
        }
        match self.upstream.dataset_endpoints(dataset_id).await {
            Ok(endpoints) if !endpoints.is_empty() => return Ok(Availability::Queryable),
            Ok(_) | Err(ClientError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match self.upstream.package(dataset_id).await? {
            Some(package) => {
                tracing::debug!(
                    dataset = %dataset_id,
                    formats = ?package.formats(),
                    "Dataset is download-only"
                );
                Ok(Availability::DownloadOnly)
            }
            None => Ok(Availability::Unavailable),
        }
    }
}
