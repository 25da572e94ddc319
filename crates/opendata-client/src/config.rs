//! Client configuration and builder pattern.

use crate::error::{ClientError, Result};
use crate::translate::TranslationPolicy;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default data service of the statistics office
pub const DEFAULT_DATA_BASE_URL: &str = "https://opendata.cbs.nl/ODataApi/OData";

/// Default catalog service of the statistics office
pub const DEFAULT_CATALOG_BASE_URL: &str = "https://opendata.cbs.nl/ODataCatalog";

/// Default package API of the national open-data portal, consulted for
/// datasets the statistics service does not serve
pub const DEFAULT_PACKAGE_BASE_URL: &str = "https://data.overheid.nl/data/api/3/action";

/// Most rows the data service returns for one `$top` request
pub const MAX_PAGE_SIZE: u64 = 10_000;

/// Prefix of every environment variable read by [`ClientConfig::from_env`]
pub const ENV_PREFIX: &str = "OPENDATA_";

/// Configuration for the open-data client.
///
/// # Security
///
/// The `Debug` implementation masks the API key to prevent accidental exposure
/// in logs. The key is shown as `"***REDACTED***"` in debug output.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the per-dataset data service
    pub data_base_url: String,
    /// Base URL of the catalog service
    pub catalog_base_url: String,
    /// Base URL of the open-data portal package API
    pub package_base_url: String,
    /// Optional API key, sent as a bearer token
    pub api_key: Option<String>,
    /// Per-request timeout (default: 30 seconds)
    pub timeout: Duration,
    /// Maximum number of retries for transient failures (default: 3)
    pub max_retries: u32,
    /// Initial retry delay for exponential backoff (default: 1 second)
    pub retry_initial_delay: Duration,
    /// Maximum retry delay (default: 10 seconds)
    pub retry_max_delay: Duration,
    /// Maximum number of in-memory metadata entries per cache (default: 512)
    pub cache_capacity: usize,
    /// Rows per page request (default: 1000)
    pub page_size: u64,
    /// Row count above which a chunked fetch is recommended (default: 5000)
    pub single_page_cutoff: u64,
    /// Ceiling for the vocabulary-product row estimate (default: 10 000 000)
    pub vocabulary_product_cap: u64,
    /// Age after which the catalog snapshot counts as stale (default: 24 hours)
    pub catalog_staleness: Duration,
    /// Row cap applied by the CLI when none is given (default: 1 000 000)
    pub max_records: u64,
    /// What to do with codes missing from a vocabulary
    pub translation_policy: TranslationPolicy,
    /// Translate time dimensions too (default: false, periods stay as codes)
    pub translate_time_dimensions: bool,
    /// Path of the local SQLite store
    pub store_path: PathBuf,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Whether to verify TLS certificates (default: true)
    pub tls_verify: bool,
    /// User-Agent header value
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_base_url: DEFAULT_DATA_BASE_URL.to_string(),
            catalog_base_url: DEFAULT_CATALOG_BASE_URL.to_string(),
            package_base_url: DEFAULT_PACKAGE_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(10),
            cache_capacity: 512,
            page_size: 1000,
            single_page_cutoff: 5000,
            vocabulary_product_cap: 10_000_000,
            catalog_staleness: Duration::from_secs(24 * 60 * 60),
            max_records: 1_000_000,
            translation_policy: TranslationPolicy::PassThrough,
            translate_time_dimensions: false,
            store_path: PathBuf::from("opendata.db"),
            log_level: "info".to_string(),
            tls_verify: true,
            user_agent: format!("opendata-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("data_base_url", &self.data_base_url)
            .field("catalog_base_url", &self.catalog_base_url)
            .field("package_base_url", &self.package_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***REDACTED***"))
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_delay", &self.retry_initial_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("cache_capacity", &self.cache_capacity)
            .field("page_size", &self.page_size)
            .field("single_page_cutoff", &self.single_page_cutoff)
            .field("vocabulary_product_cap", &self.vocabulary_product_cap)
            .field("catalog_staleness", &self.catalog_staleness)
            .field("max_records", &self.max_records)
            .field("translation_policy", &self.translation_policy)
            .field("translate_time_dimensions", &self.translate_time_dimensions)
            .field("store_path", &self.store_path)
            .field("log_level", &self.log_level)
            .field("tls_verify", &self.tls_verify)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl ClientConfig {
    /// Create a new configuration builder.
    pub fn builder(data_base_url: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(data_base_url)
    }

    /// Minimum allowed timeout value.
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);

    /// Defaults overridden by `OPENDATA_*` environment variables.
    ///
    /// Unset variables keep their default; a set but unparsable value is a
    /// configuration error rather than being ignored.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));
        let mut config = ClientConfig::default();

        if let Some(v) = var("DATA_BASE_URL") {
            config.data_base_url = v;
        }
        if let Some(v) = var("CATALOG_BASE_URL") {
            config.catalog_base_url = v;
        }
        if let Some(v) = var("PACKAGE_BASE_URL") {
            config.package_base_url = v;
        }
        if let Some(v) = var("API_KEY") {
            config.api_key = Some(v);
        }
        if let Some(v) = var("HTTP_TIMEOUT_SECS") {
            config.timeout = Duration::from_secs(parse_var("HTTP_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("MAX_RETRIES") {
            config.max_retries = parse_var("MAX_RETRIES", &v)?;
        }
        if let Some(v) = var("PAGE_SIZE") {
            config.page_size = parse_var("PAGE_SIZE", &v)?;
        }
        if let Some(v) = var("SINGLE_PAGE_CUTOFF") {
            config.single_page_cutoff = parse_var("SINGLE_PAGE_CUTOFF", &v)?;
        }
        if let Some(v) = var("CATALOG_TTL_HOURS") {
            let hours: u64 = parse_var("CATALOG_TTL_HOURS", &v)?;
            config.catalog_staleness = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(v) = var("MAX_RECORDS") {
            config.max_records = parse_var("MAX_RECORDS", &v)?;
        }
        if let Some(v) = var("TRANSLATION_POLICY") {
            config.translation_policy = parse_var("TRANSLATION_POLICY", &v)?;
        }
        if let Some(v) = var("STORE_PATH") {
            config.store_path = PathBuf::from(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            config.log_level = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("data_base_url", &self.data_base_url),
            ("catalog_base_url", &self.catalog_base_url),
            ("package_base_url", &self.package_base_url),
        ] {
            if value.is_empty() {
                return Err(ClientError::Config(format!("{} cannot be empty", name)));
            }
            url::Url::parse(value)
                .map_err(|e| ClientError::Config(format!("Invalid {}: {}", name, e)))?;
        }

        if self.cache_capacity == 0 {
            return Err(ClientError::Config(
                "cache_capacity must be > 0".to_string(),
            ));
        }

        if self.retry_initial_delay > self.retry_max_delay {
            return Err(ClientError::Config(format!(
                "retry_initial_delay ({:?}) must be <= retry_max_delay ({:?})",
                self.retry_initial_delay, self.retry_max_delay
            )));
        }

        if self.timeout < Self::MIN_TIMEOUT {
            return Err(ClientError::Config(format!(
                "timeout ({:?}) must be >= {:?}",
                self.timeout,
                Self::MIN_TIMEOUT
            )));
        }

        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ClientError::Config(format!(
                "page_size ({}) must be between 1 and {}",
                self.page_size, MAX_PAGE_SIZE
            )));
        }

        if self.single_page_cutoff == 0 {
            return Err(ClientError::Config(
                "single_page_cutoff must be > 0".to_string(),
            ));
        }

        if self.vocabulary_product_cap == 0 {
            return Err(ClientError::Config(
                "vocabulary_product_cap must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e| {
        ClientError::Config(format!("Invalid {}{}='{}': {}", ENV_PREFIX, name, value, e))
    })
}

/// Builder for client configuration.
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new builder with the given data service URL.
    pub fn new(data_base_url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                data_base_url: data_base_url.into(),
                ..Default::default()
            },
        }
    }

    /// Set the catalog service URL.
    pub fn catalog_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.catalog_base_url = url.into();
        self
    }

    /// Set the open-data portal package API URL.
    pub fn package_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.package_base_url = url.into();
        self
    }

    /// Set the API key for authentication.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = Some(api_key.into());
        self
    }

    /// Set the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the maximum number of retries.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Set the initial retry delay for exponential backoff.
    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.config.retry_initial_delay = delay;
        self
    }

    /// Set the maximum retry delay.
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry_max_delay = delay;
        self
    }

    /// Set the maximum number of in-memory cache entries.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    pub fn page_size(mut self, page_size: u64) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn single_page_cutoff(mut self, cutoff: u64) -> Self {
        self.config.single_page_cutoff = cutoff;
        self
    }

    pub fn vocabulary_product_cap(mut self, cap: u64) -> Self {
        self.config.vocabulary_product_cap = cap;
        self
    }

    pub fn catalog_staleness(mut self, staleness: Duration) -> Self {
        self.config.catalog_staleness = staleness;
        self
    }

    pub fn max_records(mut self, max_records: u64) -> Self {
        self.config.max_records = max_records;
        self
    }

    pub fn translation_policy(mut self, policy: TranslationPolicy) -> Self {
        self.config.translation_policy = policy;
        self
    }

    pub fn translate_time_dimensions(mut self, translate: bool) -> Self {
        self.config.translate_time_dimensions = translate;
        self
    }

    /// Set the path of the local SQLite store.
    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_path = path.into();
        self
    }

    /// Set whether to verify TLS certificates.
    pub fn tls_verify(mut self, verify: bool) -> Self {
        self.config.tls_verify = verify;
        self
    }

    /// Set a custom User-Agent header.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Build the configuration, validating all settings.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
