//! Metadata resolver: dataset structures, dimension vocabularies, table
//! infos and endpoint listings, resolved cache first.
//!
//! Lookup order is in-memory cache, then the persisted record in the local
//! store, then the upstream service. A persisted hit is promoted to memory
//! without a network call; an upstream hit is written to both.

use crate::backoff::Clock;
use crate::cache::{CacheStats, CoalescingCache};
use crate::error::{ClientError, Result};
use crate::types::{parse_data_properties, parse_vocabulary, DatasetEndpoints, DatasetInfo};
use crate::upstream::Upstream;
use opendata_core::validation::{validate_column_key, validate_dataset_id};
use opendata_core::{DatasetStructure, DimensionVocabulary};
use opendata_storage::{LocalSqliteStore, RecordKind};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

pub struct MetadataResolver {
    upstream: Arc<dyn Upstream>,
    store: Option<Arc<LocalSqliteStore>>,
    clock: Arc<dyn Clock>,
    structures: CoalescingCache<DatasetStructure>,
    vocabularies: CoalescingCache<DimensionVocabulary>,
    infos: CoalescingCache<DatasetInfo>,
    endpoints: CoalescingCache<DatasetEndpoints>,
}

impl MetadataResolver {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: Option<Arc<LocalSqliteStore>>,
        clock: Arc<dyn Clock>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            upstream,
            store,
            clock,
            structures: CoalescingCache::new("structures", cache_capacity),
            vocabularies: CoalescingCache::new("vocabularies", cache_capacity),
            infos: CoalescingCache::new("infos", cache_capacity),
            endpoints: CoalescingCache::new("endpoints", cache_capacity),
        }
    }

    /// Column definitions of a dataset
    pub async fn get_structure(&self, dataset_id: &str) -> Result<Arc<DatasetStructure>> {
        validate_dataset_id(dataset_id)?;
        self.structures
            .get_or_load(dataset_id, || async {
                if let Some(stored) = self.load_stored(RecordKind::Structure, dataset_id).await? {
                    return Ok(stored);
                }
                self.fetch_structure(dataset_id).await
            })
            .await
    }

    /// Refetch a dataset's structure from upstream and replace every cached copy.
    pub async fn refresh_structure(&self, dataset_id: &str) -> Result<Arc<DatasetStructure>> {
        validate_dataset_id(dataset_id)?;
        let structure = self.fetch_structure(dataset_id).await?;
        Ok(self.structures.insert(dataset_id, structure).await)
    }

    async fn fetch_structure(&self, dataset_id: &str) -> Result<DatasetStructure> {
        let items = self.upstream.data_properties(dataset_id).await?;
        let structure = DatasetStructure {
            dataset_id: dataset_id.to_string(),
            columns: parse_data_properties(dataset_id, &items)?,
        };
        tracing::info!(
            dataset = %dataset_id,
            columns = structure.columns.len(),
            "Resolved dataset structure"
        );
        self.persist(RecordKind::Structure, dataset_id, &structure).await?;
        Ok(structure)
    }

    /// Code to label table of one dimension.
    ///
    /// `dimension` must be a dimension column of the dataset's structure;
    /// anything else is `NotFound` without a vocabulary request.
    pub async fn get_vocabulary(
        &self,
        dataset_id: &str,
        dimension: &str,
    ) -> Result<Arc<DimensionVocabulary>> {
        let endpoint = self.vocabulary_endpoint(dataset_id, dimension).await?;
        let key = vocabulary_key(dataset_id, dimension);
        self.vocabularies
            .get_or_load(&key, || async {
                if let Some(stored) = self.load_stored(RecordKind::Vocabulary, &key).await? {
                    return Ok(stored);
                }
                self.fetch_vocabulary(dataset_id, &endpoint, &key).await
            })
            .await
    }

    /// Refetch a vocabulary. The cached entry is replaced wholesale when the
    /// content changed and kept as is otherwise.
    pub async fn refresh_vocabulary(
        &self,
        dataset_id: &str,
        dimension: &str,
    ) -> Result<Arc<DimensionVocabulary>> {
        let endpoint = self.vocabulary_endpoint(dataset_id, dimension).await?;
        let key = vocabulary_key(dataset_id, dimension);
        let fresh = self.fetch_vocabulary(dataset_id, &endpoint, &key).await?;

        if let Some(current) = self.vocabularies.peek(&key).await {
            if *current == fresh {
                tracing::debug!(dataset = %dataset_id, dimension = %dimension, "Vocabulary unchanged");
                return Ok(current);
            }
            tracing::info!(
                dataset = %dataset_id,
                dimension = %dimension,
                old_codes = current.len(),
                new_codes = fresh.len(),
                "Vocabulary changed, replacing"
            );
        }
        Ok(self.vocabularies.insert(&key, fresh).await)
    }

    async fn vocabulary_endpoint(&self, dataset_id: &str, dimension: &str) -> Result<String> {
        validate_dataset_id(dataset_id)?;
        validate_column_key(dimension)?;
        let structure = self.get_structure(dataset_id).await?;
        structure
            .column(dimension)
            .filter(|c| c.kind.is_dimension())
            .map(|c| c.vocabulary.clone().unwrap_or_else(|| c.key.clone()))
            .ok_or_else(|| {
                ClientError::NotFound(format!(
                    "'{}' is not a dimension of dataset '{}'",
                    dimension, dataset_id
                ))
            })
    }

    async fn fetch_vocabulary(
        &self,
        dataset_id: &str,
        endpoint: &str,
        key: &str,
    ) -> Result<DimensionVocabulary> {
        let items = self.upstream.dimension_values(dataset_id, endpoint).await?;
        let vocabulary = parse_vocabulary(dataset_id, endpoint, &items)?;
        tracing::debug!(
            dataset = %dataset_id,
            dimension = %endpoint,
            codes = vocabulary.len(),
            "Resolved vocabulary"
        );
        self.persist(RecordKind::Vocabulary, key, &vocabulary).await?;
        Ok(vocabulary)
    }

    /// Free-form TableInfos record
    pub async fn get_info(&self, dataset_id: &str) -> Result<Arc<DatasetInfo>> {
        validate_dataset_id(dataset_id)?;
        self.infos
            .get_or_load(dataset_id, || async {
                if let Some(stored) = self.load_stored(RecordKind::Info, dataset_id).await? {
                    return Ok(stored);
                }
                let items = self.upstream.table_infos(dataset_id).await?;
                let fields = items
                    .into_iter()
                    .next()
                    .and_then(|v| match v {
                        serde_json::Value::Object(map) => Some(map),
                        _ => None,
                    })
                    .ok_or_else(|| ClientError::Schema {
                        dataset_id: dataset_id.to_string(),
                        field: "TableInfos[0]".to_string(),
                    })?;
                let info = DatasetInfo {
                    dataset_id: dataset_id.to_string(),
                    fields,
                };
                self.persist(RecordKind::Info, dataset_id, &info).await?;
                Ok(info)
            })
            .await
    }

    /// Metadata endpoints, split into standard and dimension endpoints
    pub async fn get_endpoints(&self, dataset_id: &str) -> Result<Arc<DatasetEndpoints>> {
        validate_dataset_id(dataset_id)?;
        self.endpoints
            .get_or_load(dataset_id, || async {
                if let Some(stored) = self.load_stored(RecordKind::Endpoints, dataset_id).await? {
                    return Ok(stored);
                }
                let records = self.upstream.dataset_endpoints(dataset_id).await?;
                let endpoints = DatasetEndpoints::from_records(dataset_id, records);
                self.persist(RecordKind::Endpoints, dataset_id, &endpoints).await?;
                Ok(endpoints)
            })
            .await
    }

    /// Drop every in-memory entry; persisted records are kept.
    pub async fn clear_memory(&self) {
        self.structures.clear().await;
        self.vocabularies.clear().await;
        self.infos.clear().await;
        self.endpoints.clear().await;
    }

    pub async fn cache_stats(&self) -> Vec<CacheStats> {
        vec![
            self.structures.stats().await,
            self.vocabularies.stats().await,
            self.infos.stats().await,
            self.endpoints.stats().await,
        ]
    }

    async fn load_stored<T>(&self, kind: RecordKind, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.get_record::<T>(kind, key).await {
            Ok(Some(record)) => {
                tracing::debug!(kind = %kind, key = %key, "Loaded persisted metadata");
                Ok(Some(record.value))
            }
            Ok(None) => Ok(None),
            Err(opendata_core::CatalogError::SerializationError(e)) => {
                tracing::warn!(kind = %kind, key = %key, error = %e, "Ignoring unreadable persisted metadata");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist<T: Serialize>(&self, kind: RecordKind, key: &str, value: &T) -> Result<()> {
        if let Some(store) = &self.store {
            store.put_record(kind, key, value, self.clock.now()).await?;
        }
        Ok(())
    }
}

fn vocabulary_key(dataset_id: &str, dimension: &str) -> String {
    format!("{}/{}", dataset_id, dimension)
}
