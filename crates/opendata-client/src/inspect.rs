//! One-shot dataset report: catalog entry, info, structure and a translated
//! sample when the data service knows the dataset, the portal package when
//! only files are published.

use crate::backoff::{retry_transient, BackoffPolicy, Clock};
use crate::config::MAX_PAGE_SIZE;
use crate::error::{ClientError, Result};
use crate::metadata::MetadataResolver;
use crate::query::QueryParams;
use crate::translate::Translator;
use crate::types::{DatasetInfo, DownloadPackage};
use crate::upstream::{PageRequest, Upstream};
use opendata_core::validation::validate_dataset_id;
use opendata_core::{DatasetDescriptor, DatasetStructure, Row};
use opendata_storage::LocalSqliteStore;
use std::sync::Arc;

/// Rows in a sample unless asked otherwise
pub const DEFAULT_SAMPLE_SIZE: u64 = 5;

#[derive(Debug, Clone)]
pub enum InspectReport {
    Queryable(QueryableReport),
    DownloadOnly(DownloadPackage),
    NotFound { dataset_id: String },
}

#[derive(Debug, Clone)]
pub struct QueryableReport {
    pub dataset_id: String,
    /// Catalog entry, when the local snapshot has one
    pub descriptor: Option<DatasetDescriptor>,
    pub info: Option<Arc<DatasetInfo>>,
    pub structure: Arc<DatasetStructure>,
    pub sample: Vec<Row>,
    /// Total reported alongside the sample
    pub row_count: Option<u64>,
    /// False when translation failed and the sample keeps raw codes
    pub sample_translated: bool,
}

impl QueryableReport {
    /// Catalog title, else the TableInfos title, else the id
    pub fn title(&self) -> &str {
        self.descriptor
            .as_ref()
            .map(|d| d.title.as_str())
            .or_else(|| self.info.as_deref().and_then(|i| i.get_str("Title")))
            .unwrap_or(&self.dataset_id)
    }
}

pub struct Inspector {
    upstream: Arc<dyn Upstream>,
    store: Arc<LocalSqliteStore>,
    resolver: Arc<MetadataResolver>,
    translator: Arc<Translator>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl Inspector {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: Arc<LocalSqliteStore>,
        resolver: Arc<MetadataResolver>,
        translator: Arc<Translator>,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            upstream,
            store,
            resolver,
            translator,
            backoff,
            clock,
        }
    }

    /// Build a report for `dataset_id`.
    ///
    /// A missing structure sends the lookup to the open-data portal. Info and
    /// translation failures only degrade the report.
    pub async fn inspect(&self, dataset_id: &str, sample_size: u64) -> Result<InspectReport> {
        validate_dataset_id(dataset_id)?;
        if sample_size == 0 || sample_size > MAX_PAGE_SIZE {
            return Err(ClientError::Validation(format!(
                "sample size {} is outside 1..={}",
                sample_size, MAX_PAGE_SIZE
            )));
        }

        let structure = match self.resolver.get_structure(dataset_id).await {
            Ok(structure) => structure,
            Err(ClientError::NotFound(_)) => {
                return Ok(match self.upstream.package(dataset_id).await? {
                    Some(package) => {
                        tracing::info!(
                            dataset = %dataset_id,
                            resources = package.resources.len(),
                            "Dataset is published as downloads only"
                        );
                        InspectReport::DownloadOnly(package)
                    }
                    None => InspectReport::NotFound {
                        dataset_id: dataset_id.to_string(),
                    },
                });
            }
            Err(e) => return Err(e),
        };

        let descriptor = self.store.get_descriptor(dataset_id).await?;
        let info = match self.resolver.get_info(dataset_id).await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(dataset = %dataset_id, error = %e, "Table info unavailable");
                None
            }
        };

        let params = QueryParams::all(dataset_id);
        let request = PageRequest {
            top: sample_size,
            skip: 0,
            inline_count: true,
        };
        let page = retry_transient(&self.backoff, self.clock.as_ref(), dataset_id, 0, || {
            self.upstream.query_page(&params, request)
        })
        .await
        .map_err(|(err, _)| err)?;

        let mut sample = page.rows;
        sample.truncate(usize::try_from(sample_size).unwrap_or(usize::MAX));
        let mut translated = sample.clone();
        let sample_translated = match self.translator.translate_rows(dataset_id, &mut translated).await {
            Ok(()) => {
                sample = translated;
                true
            }
            Err(e) => {
                tracing::warn!(dataset = %dataset_id, error = %e, "Sample kept raw codes");
                false
            }
        };

        tracing::debug!(
            dataset = %dataset_id,
            columns = structure.columns.len(),
            sample = sample.len(),
            "Inspected dataset"
        );
        Ok(InspectReport::Queryable(QueryableReport {
            dataset_id: dataset_id.to_string(),
            descriptor,
            info,
            structure,
            sample,
            row_count: page.total,
            sample_translated,
        }))
    }
}
