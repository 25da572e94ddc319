//! Shared fixtures: an in-memory upstream with request counters and failure
//! injection, a recording clock and a collecting sink.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use opendata_client::types::{CatalogTableRecord, DownloadPackage, EndpointRecord, PackageResource};
use opendata_client::{
    ClientConfig, ClientError, Clock, OpenData, Page, PageRequest, QueryParams, Result, Upstream,
};
use opendata_core::{Row, RowBatch, RowSink, SinkError};
use opendata_storage::LocalSqliteStore;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Scripted upstream
// ============================================================================

/// Failure injected into a page request
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// 503, retried by the engine
    Unavailable,
    /// 400, surfaced immediately
    BadRequest,
}

impl Failure {
    fn into_error(self) -> ClientError {
        match self {
            Failure::Unavailable => ClientError::ServerError {
                status: 503,
                message: "Service Unavailable".into(),
                request_id: None,
            },
            Failure::BadRequest => ClientError::BadRequest {
                status: 400,
                message: "Invalid $filter".into(),
            },
        }
    }
}

#[derive(Default)]
pub struct ScriptedUpstream {
    catalog: Mutex<Vec<CatalogTableRecord>>,
    properties: HashMap<String, Vec<Value>>,
    vocabularies: HashMap<(String, String), Vec<Value>>,
    infos: HashMap<String, Value>,
    rows: HashMap<String, Vec<Row>>,
    packages: HashMap<String, DownloadPackage>,
    hide_count: bool,
    max_top: Option<u64>,
    latency: Option<Duration>,
    failures: Mutex<HashMap<u64, VecDeque<Failure>>>,

    pub catalog_requests: AtomicUsize,
    pub endpoint_requests: AtomicUsize,
    pub property_requests: AtomicUsize,
    pub vocabulary_requests: AtomicUsize,
    pub info_requests: AtomicUsize,
    pub package_requests: AtomicUsize,
    pub page_requests: Mutex<Vec<(QueryParams, PageRequest)>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(self, records: Vec<CatalogTableRecord>) -> Self {
        *self.catalog.lock().unwrap() = records;
        self
    }

    pub fn with_dataset(mut self, dataset_id: &str, properties: Vec<Value>, rows: Vec<Row>) -> Self {
        self.properties.insert(dataset_id.to_string(), properties);
        self.rows.insert(dataset_id.to_string(), rows);
        self
    }

    pub fn with_vocabulary(mut self, dataset_id: &str, dimension: &str, entries: &[(&str, &str)]) -> Self {
        let items = entries
            .iter()
            .map(|(code, label)| json!({"Key": code, "Title": label, "Description": null}))
            .collect();
        self.vocabularies
            .insert((dataset_id.to_string(), dimension.to_string()), items);
        self
    }

    pub fn with_info(mut self, dataset_id: &str, info: Value) -> Self {
        self.infos.insert(dataset_id.to_string(), info);
        self
    }

    /// Never report `odata.count`
    /// Register a download-only package on the open-data portal
    pub fn with_package(mut self, dataset_id: &str, title: &str, resources: &[(&str, &str, &str)]) -> Self {
        let package = DownloadPackage {
            name: dataset_id.to_string(),
            title: title.to_string(),
            notes: Some(format!("Notes for {}", title)),
            resources: resources
                .iter()
                .map(|(name, format, url)| PackageResource {
                    name: Some(name.to_string()),
                    format: Some(format.to_string()),
                    url: Some(url.to_string()),
                })
                .collect(),
        };
        self.packages.insert(dataset_id.to_string(), package);
        self
    }

    pub fn without_count(mut self) -> Self {
        self.hide_count = true;
        self
    }

    /// Serve at most `max_top` rows per page, whatever `$top` asks for
    pub fn with_max_top(mut self, max_top: u64) -> Self {
        self.max_top = Some(max_top);
        self
    }

    /// Delay every metadata response
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `times` requests for the page at `skip`
    pub fn fail_at(&self, skip: u64, times: usize, failure: Failure) {
        self.failures
            .lock()
            .unwrap()
            .entry(skip)
            .or_default()
            .extend(std::iter::repeat(failure).take(times));
    }

    pub fn replace_catalog(&self, records: Vec<CatalogTableRecord>) {
        *self.catalog.lock().unwrap() = records;
    }

    pub fn page_offsets(&self) -> Vec<u64> {
        self.page_requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, page)| page.skip)
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.page_requests.lock().unwrap().len()
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn list_catalog(&self) -> Result<Vec<CatalogTableRecord>> {
        self.catalog_requests.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(self.catalog.lock().unwrap().clone())
    }

    async fn dataset_endpoints(&self, dataset_id: &str) -> Result<Vec<EndpointRecord>> {
        self.endpoint_requests.fetch_add(1, Ordering::SeqCst);
        let properties = self
            .properties
            .get(dataset_id)
            .ok_or_else(|| ClientError::NotFound(dataset_id.to_string()))?;
        let mut names = vec!["TableInfos".to_string(), "TypedDataSet".to_string(), "DataProperties".to_string()];
        names.extend(
            properties
                .iter()
                .filter(|p| p["Type"].as_str().is_some_and(|t| t.ends_with("Dimension")))
                .filter_map(|p| p["Key"].as_str().map(str::to_string)),
        );
        Ok(names
            .into_iter()
            .map(|name| EndpointRecord {
                url: format!("https://example.test/{}/{}", dataset_id, name),
                name,
            })
            .collect())
    }

    async fn data_properties(&self, dataset_id: &str) -> Result<Vec<Value>> {
        self.property_requests.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.properties
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(dataset_id.to_string()))
    }

    async fn dimension_values(&self, dataset_id: &str, dimension: &str) -> Result<Vec<Value>> {
        self.vocabulary_requests.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.vocabularies
            .get(&(dataset_id.to_string(), dimension.to_string()))
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("{}/{}", dataset_id, dimension)))
    }

    async fn table_infos(&self, dataset_id: &str) -> Result<Vec<Value>> {
        self.info_requests.fetch_add(1, Ordering::SeqCst);
        self.infos
            .get(dataset_id)
            .map(|info| vec![info.clone()])
            .ok_or_else(|| ClientError::NotFound(dataset_id.to_string()))
    }

    async fn package(&self, dataset_id: &str) -> Result<Option<DownloadPackage>> {
        self.package_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.packages.get(dataset_id).cloned())
    }

    async fn query_page(&self, query: &QueryParams, page: PageRequest) -> Result<Page> {
        self.page_requests.lock().unwrap().push((query.clone(), page));

        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&page.skip)
            .and_then(VecDeque::pop_front);
        if let Some(failure) = failure {
            return Err(failure.into_error());
        }

        let rows = self
            .rows
            .get(&query.dataset_id)
            .ok_or_else(|| ClientError::NotFound(query.dataset_id.clone()))?;
        let start = (page.skip as usize).min(rows.len());
        let top = page.top.min(self.max_top.unwrap_or(u64::MAX));
        let end = (start + top as usize).min(rows.len());
        let mut slice = rows[start..end].to_vec();
        if let Some(select) = &query.select {
            for row in &mut slice {
                row.retain(|key, _| select.contains(key));
            }
        }
        Ok(Page {
            rows: slice,
            total: (page.inline_count && !self.hide_count).then_some(rows.len() as u64),
        })
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub const POPULATION: &str = "85313NED";

pub fn population_properties() -> Vec<Value> {
    vec![
        json!({"ID": 0, "Type": "TopicGroup", "Key": "", "Title": "Bevolking"}),
        json!({"ID": 1, "Type": "Dimension", "Key": "Geslacht", "Title": "Geslacht"}),
        json!({"ID": 2, "Type": "GeoDimension", "Key": "RegioS", "Title": "Regio's"}),
        json!({"ID": 3, "Type": "TimeDimension", "Key": "Perioden", "Title": "Perioden"}),
        json!({"ID": 4, "Type": "Topic", "Key": "Bevolking_1", "Title": "Bevolking",
               "Unit": "aantal", "Datatype": "Long"}),
    ]
}

/// `count` rows cycling over two sexes, three regions and two periods
pub fn population_rows(count: usize) -> Vec<Row> {
    let sexes = ["T001038", "3000"];
    let regions = ["GM0363", "GM0599", "GM0518"];
    let periods = ["2022JJ00", "2023JJ00"];
    (0..count)
        .map(|i| {
            let value = json!({
                "ID": i,
                "Geslacht": sexes[i % sexes.len()],
                "RegioS": regions[i % regions.len()],
                "Perioden": periods[i % periods.len()],
                "Bevolking_1": 1000 + i,
            });
            match value {
                Value::Object(row) => row,
                _ => unreachable!(),
            }
        })
        .collect()
}

pub fn population_upstream(rows: usize) -> ScriptedUpstream {
    ScriptedUpstream::new()
        .with_dataset(POPULATION, population_properties(), population_rows(rows))
        .with_vocabulary(POPULATION, "Geslacht", &[("T001038", "Totaal mannen en vrouwen"), ("3000", "Mannen")])
        .with_vocabulary(
            POPULATION,
            "RegioS",
            &[("GM0363", "Amsterdam"), ("GM0599", "Rotterdam"), ("GM0518", "'s-Gravenhage")],
        )
        .with_vocabulary(POPULATION, "Perioden", &[("2022JJ00", "2022"), ("2023JJ00", "2023")])
}

pub fn catalog_record(id: &str, title: &str, summary: &str) -> CatalogTableRecord {
    CatalogTableRecord {
        identifier: Some(id.to_string()),
        title: Some(title.to_string()),
        summary: Some(summary.to_string()),
        output_status: Some("Regulier".to_string()),
        catalog: Some("CBS".to_string()),
        record_count: Some(1000),
        column_count: Some(8),
        modified: Some("2024-03-01T02:00:00".to_string()),
    }
}

// ============================================================================
// Clock and sink
// ============================================================================

/// Clock that records requested sleeps instead of sleeping
pub struct RecordingClock {
    now: Mutex<DateTime<Utc>>,
    pub sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }

    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Keeps every batch; optionally rejects the batch with a given sequence
#[derive(Default)]
pub struct CollectSink {
    pub batches: Vec<RowBatch>,
    pub reject_sequence: Option<u64>,
    pub finished: bool,
}

impl CollectSink {
    pub fn rejecting(sequence: u64) -> Self {
        Self {
            reject_sequence: Some(sequence),
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<Row> {
        self.batches.iter().flat_map(|b| b.rows.clone()).collect()
    }

    pub fn row_count(&self) -> u64 {
        self.batches.iter().map(|b| b.len() as u64).sum()
    }
}

#[async_trait]
impl RowSink for CollectSink {
    async fn accept(&mut self, batch: RowBatch) -> std::result::Result<(), SinkError> {
        if self.reject_sequence == Some(batch.sequence) {
            return Err(SinkError::Rejected(format!("batch {}", batch.sequence)));
        }
        self.batches.push(batch);
        Ok(())
    }

    async fn finish(&mut self) -> std::result::Result<(), SinkError> {
        self.finished = true;
        Ok(())
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct Harness {
    pub upstream: Arc<ScriptedUpstream>,
    pub clock: Arc<RecordingClock>,
    pub od: OpenData,
    _dir: TempDir,
}

pub fn test_config() -> ClientConfig {
    ClientConfig::builder("https://example.test/ODataApi/OData")
        .max_retries(3)
        .retry_initial_delay(Duration::from_millis(100))
        .retry_max_delay(Duration::from_secs(1))
        .build()
        .unwrap()
}

pub async fn harness(upstream: ScriptedUpstream) -> Harness {
    harness_with_config(upstream, test_config()).await
}

pub async fn harness_with_config(upstream: ScriptedUpstream, config: ClientConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalSqliteStore::new(dir.path().join("opendata.db")));
    store.initialize().await.unwrap();

    let upstream = Arc::new(upstream);
    let clock = Arc::new(RecordingClock::new());
    let od = OpenData::with_upstream(
        config,
        Arc::clone(&upstream) as Arc<dyn Upstream>,
        store,
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    Harness {
        upstream,
        clock,
        od,
        _dir: dir,
    }
}
