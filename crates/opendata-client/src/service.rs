//! Wiring of every component around one upstream, store and clock.

use crate::backoff::{BackoffPolicy, Clock, TokioClock};
use crate::catalog::CatalogIndex;
use crate::client::ODataClient;
use crate::config::ClientConfig;
use crate::engine::FetchEngine;
use crate::error::Result;
use crate::estimate::SizeEstimator;
use crate::inspect::Inspector;
use crate::metadata::MetadataResolver;
use crate::query::QueryBuilder;
use crate::translate::Translator;
use crate::upstream::Upstream;
use opendata_storage::LocalSqliteStore;
use std::sync::Arc;

/// Catalog index, resolver, estimator, inspector and fetch engine sharing one
/// cache set.
pub struct OpenData {
    config: ClientConfig,
    store: Arc<LocalSqliteStore>,
    catalog: CatalogIndex,
    resolver: Arc<MetadataResolver>,
    builder: QueryBuilder,
    estimator: SizeEstimator,
    inspector: Inspector,
    engine: FetchEngine,
}

impl OpenData {
    /// Connect to the configured OData services and open the local store.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let upstream: Arc<dyn Upstream> = Arc::new(ODataClient::new(config.clone())?);
        let store = Arc::new(LocalSqliteStore::new(&config.store_path));
        store.initialize().await?;
        tracing::debug!(store = %config.store_path.display(), "Opened local store");
        Ok(Self::with_upstream(config, upstream, store, Arc::new(TokioClock)))
    }

    /// Build on an existing upstream and an initialized store.
    pub fn with_upstream(
        config: ClientConfig,
        upstream: Arc<dyn Upstream>,
        store: Arc<LocalSqliteStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let backoff = BackoffPolicy::from_config(&config);
        let resolver = Arc::new(MetadataResolver::new(
            Arc::clone(&upstream),
            Some(Arc::clone(&store)),
            Arc::clone(&clock),
            config.cache_capacity,
        ));
        let translator = Arc::new(Translator::new(
            Arc::clone(&resolver),
            config.translation_policy,
            config.translate_time_dimensions,
        ));
        let catalog = CatalogIndex::new(
            Arc::clone(&upstream),
            Arc::clone(&store),
            Arc::clone(&clock),
            config.catalog_staleness,
        );
        let estimator = SizeEstimator::new(
            Arc::clone(&upstream),
            Arc::clone(&resolver),
            backoff,
            Arc::clone(&clock),
            config.single_page_cutoff,
            config.vocabulary_product_cap,
        );
        let inspector = Inspector::new(
            Arc::clone(&upstream),
            Arc::clone(&store),
            Arc::clone(&resolver),
            Arc::clone(&translator),
            backoff,
            Arc::clone(&clock),
        );
        let engine = FetchEngine::new(
            upstream,
            Arc::clone(&resolver),
            translator,
            backoff,
            clock,
        );

        Self {
            config,
            store,
            catalog,
            builder: QueryBuilder::new(Arc::clone(&resolver)),
            resolver,
            estimator,
            inspector,
            engine,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalSqliteStore> {
        &self.store
    }

    pub fn catalog(&self) -> &CatalogIndex {
        &self.catalog
    }

    pub fn resolver(&self) -> &Arc<MetadataResolver> {
        &self.resolver
    }

    pub fn query_builder(&self) -> &QueryBuilder {
        &self.builder
    }

    pub fn estimator(&self) -> &SizeEstimator {
        &self.estimator
    }

    pub fn inspector(&self) -> &Inspector {
        &self.inspector
    }

    pub fn engine(&self) -> &FetchEngine {
        &self.engine
    }
}
