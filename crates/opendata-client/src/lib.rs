//! Open-data statistics client
//!
//! Catalog search, metadata resolution and paginated row retrieval against an
//! OData v3 statistics service, with a local SQLite store for the catalog
//! snapshot and resolved metadata.
//!
//! # Features
//!
//! - **Catalog Index**: keyword search over a locally persisted catalog snapshot
//! - **Metadata Resolver**: structures, vocabularies and table infos, cache
//!   first with request coalescing
//! - **Size Estimator**: one-row probe that recommends a fetch strategy
//! - **Query Builder**: typed filters checked against the dataset's columns
//!   before any data request
//! - **Inspector**: one-shot report with a translated sample, falling back to
//!   the open-data portal for download-only datasets
//! - **Fetch Engine**: `$top`/`$skip` paging into a sink with bounded retry,
//!   cancellation and resumable cursors
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use opendata_client::{ClientConfig, OpenData};
//! use opendata_core::{Filter, QuerySpec};
//! use opendata_storage::CsvSink;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let od = OpenData::connect(ClientConfig::from_env()?).await?;
//!
//!     if od.catalog().is_stale().await? {
//!         od.catalog().refresh().await?;
//!     }
//!     for d in od.catalog().search("bevolking", Default::default(), 10).await? {
//!         println!("{}: {}", d.identifier, d.title);
//!     }
//!
//!     let spec = QuerySpec::new("85313NED")
//!         .with_filter(Filter::equals("RegioS", "GM0363"))
//!         .with_row_cap(10_000);
//!     let mut sink = CsvSink::create("amsterdam.csv")?;
//!     let result = od.engine().fetch(spec, 1000, &mut sink, None).await?;
//!     println!("{} rows", result.total_rows_emitted);
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All operations return `Result<T, ClientError>`. Page failures carry the
//! cursor of the last delivered batch; pass it to
//! [`FetchEngine::resume_from`] to continue.

pub mod backoff;
pub mod cache;
pub mod catalog;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod inspect;
pub mod metadata;
pub mod query;
pub mod service;
pub mod translate;
pub mod types;
pub mod upstream;

// Re-exports for convenience
pub use backoff::{BackoffPolicy, Clock, TokioClock};
pub use cache::{CacheStats, CoalescingCache};
pub use catalog::{Availability, CatalogIndex};
pub use client::{ODataClient, SharedClient};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use engine::{CancelSignal, FetchEngine, FetchResult};
pub use error::{ClientError, Result};
pub use estimate::{FetchStrategy, SizeEstimate, SizeEstimator};
pub use inspect::{InspectReport, Inspector, QueryableReport, DEFAULT_SAMPLE_SIZE};
pub use metadata::MetadataResolver;
pub use query::{QueryBuilder, QueryParams};
pub use service::OpenData;
pub use translate::{TranslationPolicy, Translator};
pub use types::{DatasetEndpoints, DatasetInfo, DownloadPackage};
pub use upstream::{Page, PageRequest, SharedUpstream, Upstream};
