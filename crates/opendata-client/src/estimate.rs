//! Size estimation ahead of a full fetch.

use crate::backoff::{retry_transient, BackoffPolicy, Clock};
use crate::error::{ClientError, Result};
use crate::metadata::MetadataResolver;
use crate::query::QueryParams;
use crate::upstream::{PageRequest, Upstream};
use opendata_core::validation::validate_dataset_id;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How a dataset should be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    SinglePage,
    Chunked,
}

impl std::fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStrategy::SinglePage => write!(f, "single_page"),
            FetchStrategy::Chunked => write!(f, "chunked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEstimate {
    pub dataset_id: String,
    pub approx_row_count: u64,
    pub column_count: usize,
    pub recommended_strategy: FetchStrategy,
    /// Row count is derived from vocabulary sizes rather than reported
    pub approximate: bool,
    /// Subsetting columns is recommended
    pub use_projection: bool,
}

pub struct SizeEstimator {
    upstream: Arc<dyn Upstream>,
    resolver: Arc<MetadataResolver>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    single_page_cutoff: u64,
    product_cap: u64,
}

impl SizeEstimator {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        resolver: Arc<MetadataResolver>,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
        single_page_cutoff: u64,
        product_cap: u64,
    ) -> Self {
        Self {
            upstream,
            resolver,
            backoff,
            clock,
            single_page_cutoff,
            product_cap,
        }
    }

    /// Probe a dataset with a one-row request and recommend a strategy.
    ///
    /// Uses the reported inline count when present; otherwise the product of
    /// the dimension vocabulary sizes, capped and flagged approximate.
    pub async fn estimate(
        &self,
        dataset_id: &str,
        projection: Option<&[String]>,
    ) -> Result<SizeEstimate> {
        validate_dataset_id(dataset_id)?;
        let structure = self.resolver.get_structure(dataset_id).await?;
        if let Some(columns) = projection {
            if let Some(unknown) = columns.iter().find(|c| !structure.has_column(c)) {
                return Err(ClientError::InvalidColumn {
                    dataset_id: dataset_id.to_string(),
                    column: unknown.clone(),
                });
            }
        }

        let params = QueryParams::all(dataset_id);
        let probe = PageRequest {
            top: 1,
            skip: 0,
            inline_count: true,
        };
        let page = retry_transient(&self.backoff, self.clock.as_ref(), dataset_id, 0, || {
            self.upstream.query_page(&params, probe)
        })
        .await
        .map_err(|(err, _)| err)?;

        let (approx_row_count, approximate) = match page.total {
            Some(total) => (total, false),
            None => (self.vocabulary_product(dataset_id, page.rows.len()).await?, true),
        };

        let data_columns = structure.columns.len();
        let column_count = if data_columns > 0 {
            data_columns
        } else {
            page.rows.first().map(|r| r.len()).unwrap_or(0)
        };

        let recommended_strategy = if approx_row_count > self.single_page_cutoff {
            FetchStrategy::Chunked
        } else {
            FetchStrategy::SinglePage
        };

        let estimate = SizeEstimate {
            dataset_id: dataset_id.to_string(),
            approx_row_count,
            column_count,
            recommended_strategy,
            approximate,
            use_projection: recommended_strategy == FetchStrategy::Chunked && projection.is_some(),
        };
        tracing::info!(
            dataset = %dataset_id,
            rows = estimate.approx_row_count,
            columns = estimate.column_count,
            approximate = estimate.approximate,
            strategy = %estimate.recommended_strategy,
            "Estimated dataset size"
        );
        Ok(estimate)
    }

    async fn vocabulary_product(&self, dataset_id: &str, probe_rows: usize) -> Result<u64> {
        let structure = self.resolver.get_structure(dataset_id).await?;
        let mut product: Option<u64> = None;
        for column in structure.dimensions() {
            let vocabulary = self.resolver.get_vocabulary(dataset_id, &column.key).await?;
            let size = vocabulary.len() as u64;
            product = Some(product.unwrap_or(1).saturating_mul(size).min(self.product_cap));
        }
        Ok(product.unwrap_or(probe_rows as u64))
    }
}
