//! HTTP client for the OData v3 catalog and data services.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::query::QueryParams;
use crate::types::{
    CatalogTableRecord, DownloadPackage, EndpointRecord, ODataCollection, PackageResponse,
};
use crate::upstream::{Page, PageRequest, Upstream};
use async_trait::async_trait;
use opendata_core::Row;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{
    policies::ExponentialBackoff, RetryTransientMiddleware, Retryable, RetryableStrategy,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Catalog rows requested per `Tables` page
const CATALOG_PAGE_SIZE: u64 = 10_000;

const CATALOG_SELECT: &str =
    "Identifier,Title,Summary,OutputStatus,Catalog,RecordCount,ColumnCount,Modified";

/// OData client with automatic retries for metadata requests.
///
/// Row pages go through a separate client without retry middleware; the
/// fetch engine retries them itself so it can keep its cursor exact. The
/// open-data portal gets its own client that never sends the API key.
pub struct ODataClient {
    http: ClientWithMiddleware,
    pages: ClientWithMiddleware,
    portal: ClientWithMiddleware,
    config: ClientConfig,
}

impl ODataClient {
    /// Create a new client builder with the given data service URL.
    pub fn builder(data_base_url: impl Into<String>) -> crate::config::ClientConfigBuilder {
        crate::config::ClientConfigBuilder::new(data_base_url)
    }

    /// Create a new client with the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("opendata-client")),
        );

        let portal_client = reqwest::Client::builder()
            .default_headers(headers.clone())
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.tls_verify)
            .build()?;

        if let Some(ref api_key) = config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|_| ClientError::Config("Invalid API key format".to_string()))?,
            );
        }

        let reqwest_client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.tls_verify)
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(config.retry_initial_delay, config.retry_max_delay)
            .build_with_max_retries(config.max_retries);

        let http = ClientBuilder::new(reqwest_client.clone())
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                TransientRetryStrategy,
            ))
            .build();
        let pages = ClientBuilder::new(reqwest_client).build();
        let portal = ClientBuilder::new(portal_client)
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                TransientRetryStrategy,
            ))
            .build();

        Ok(Self {
            http,
            pages,
            portal,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.data_base_url.trim_end_matches('/'), path)
    }

    fn catalog_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.catalog_base_url.trim_end_matches('/'),
            path
        )
    }

    fn package_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.package_base_url.trim_end_matches('/'),
            path
        )
    }

    /// GET a URL through the retrying client and deserialize the JSON body.
    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        Self::request(&self.http, url).await
    }

    async fn request<T: DeserializeOwned>(http: &ClientWithMiddleware, url: &str) -> Result<T> {
        let start = std::time::Instant::now();
        tracing::debug!(url = %url, "Sending request");

        let response = http.get(url).send().await?;
        let status = response.status();
        let duration = start.elapsed();

        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        tracing::debug!(
            url = %url,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            request_id = ?request_id,
            "Received response"
        );

        if status.is_success() {
            let body = response.bytes().await?;
            serde_json::from_slice(&body).map_err(|e| {
                ClientError::InvalidResponse(format!(
                    "Failed to parse response from {}: {} (body: {})",
                    url,
                    e,
                    truncate(&String::from_utf8_lossy(&body), 200)
                ))
            })
        } else {
            let retry_after = Self::parse_retry_after(response.headers());
            let body = response.bytes().await.ok();
            let message = body
                .as_deref()
                .and_then(odata_error_message)
                .or_else(|| {
                    body.as_ref()
                        .map(|b| truncate(&String::from_utf8_lossy(b), 200))
                        .filter(|s| !s.is_empty())
                })
                .unwrap_or_else(|| status.to_string());

            tracing::warn!(
                url = %url,
                status = %status.as_u16(),
                duration_ms = %duration.as_millis(),
                request_id = ?request_id,
                error = %message,
                "Request failed"
            );

            Err(Self::status_to_error(
                status,
                format!("{} ({})", message, url),
                request_id,
                retry_after,
            ))
        }
    }

    /// Convert HTTP status to appropriate error type.
    fn status_to_error(
        status: StatusCode,
        message: String,
        request_id: Option<String>,
        retry_after: Option<std::time::Duration>,
    ) -> ClientError {
        match status {
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            StatusCode::UNAUTHORIZED => ClientError::Unauthorized(message),
            StatusCode::FORBIDDEN => ClientError::Forbidden(message),
            StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited {
                retry_after,
                request_id,
            },
            s if s.is_server_error() => ClientError::ServerError {
                status: s.as_u16(),
                message,
                request_id,
            },
            s => ClientError::BadRequest {
                status: s.as_u16(),
                message,
            },
        }
    }

    /// Parse the Retry-After header value into a Duration.
    ///
    /// Supports both formats per RFC 7231:
    /// - Seconds: "120" -> Duration::from_secs(120)
    /// - HTTP-date: "Fri, 31 Dec 2024 23:59:59 GMT" -> Duration until that time
    fn parse_retry_after(headers: &HeaderMap) -> Option<std::time::Duration> {
        let header_value = headers.get("retry-after")?.to_str().ok()?;

        if let Ok(seconds) = header_value.parse::<u64>() {
            return Some(std::time::Duration::from_secs(seconds));
        }

        if let Ok(date) = httpdate::parse_http_date(header_value) {
            let now = std::time::SystemTime::now();
            return Some(date.duration_since(now).unwrap_or(std::time::Duration::ZERO));
        }

        None
    }
}

/// `{"odata.error": {"message": {"value": "..."}}}`
fn odata_error_message(body: &[u8]) -> Option<String> {
    let json: Value = serde_json::from_slice(body).ok()?;
    json.get("odata.error")?
        .get("message")?
        .get("value")?
        .as_str()
        .map(str::to_string)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl Upstream for ODataClient {
    async fn list_catalog(&self) -> Result<Vec<CatalogTableRecord>> {
        let mut records = Vec::new();
        let mut skip = 0u64;
        loop {
            let url = self.catalog_url(&format!(
                "Tables?$format=json&$select={}&$top={}&$skip={}",
                CATALOG_SELECT, CATALOG_PAGE_SIZE, skip
            ));
            let page: ODataCollection<CatalogTableRecord> = self.get(&url).await?;
            let returned = page.value.len() as u64;
            records.extend(page.value);
            tracing::debug!(skip, returned, "Fetched catalog page");
            if returned < CATALOG_PAGE_SIZE {
                break;
            }
            skip += returned;
        }
        Ok(records)
    }

    async fn dataset_endpoints(&self, dataset_id: &str) -> Result<Vec<EndpointRecord>> {
        let url = self.data_url(&format!("{}?$format=json", urlencoding::encode(dataset_id)));
        let doc: ODataCollection<EndpointRecord> = self.get(&url).await?;
        Ok(doc.value)
    }

    async fn data_properties(&self, dataset_id: &str) -> Result<Vec<Value>> {
        let url = self.data_url(&format!(
            "{}/DataProperties?$format=json",
            urlencoding::encode(dataset_id)
        ));
        let doc: ODataCollection<Value> = self.get(&url).await?;
        Ok(doc.value)
    }

    async fn dimension_values(&self, dataset_id: &str, dimension: &str) -> Result<Vec<Value>> {
        let url = self.data_url(&format!(
            "{}/{}?$format=json",
            urlencoding::encode(dataset_id),
            urlencoding::encode(dimension)
        ));
        let doc: ODataCollection<Value> = self.get(&url).await?;
        Ok(doc.value)
    }

    async fn table_infos(&self, dataset_id: &str) -> Result<Vec<Value>> {
        let url = self.data_url(&format!(
            "{}/TableInfos?$format=json",
            urlencoding::encode(dataset_id)
        ));
        let doc: ODataCollection<Value> = self.get(&url).await?;
        Ok(doc.value)
    }

    async fn package(&self, dataset_id: &str) -> Result<Option<DownloadPackage>> {
        let url = self.package_url(&format!(
            "package_show?id={}",
            urlencoding::encode(dataset_id)
        ));
        match Self::request::<PackageResponse>(&self.portal, &url).await {
            Ok(response) if response.success => Ok(response.result),
            Ok(_) | Err(ClientError::NotFound(_)) => {
                tracing::debug!(dataset = %dataset_id, "No open-data portal package");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn query_page(&self, query: &QueryParams, page: PageRequest) -> Result<Page> {
        let url = self.data_url(&format!(
            "{}/TypedDataSet?{}",
            urlencoding::encode(&query.dataset_id),
            query.to_query_string(page)
        ));
        let doc: ODataCollection<Row> = Self::request(&self.pages, &url).await?;
        Ok(Page {
            rows: doc.value,
            total: doc.count,
        })
    }
}

/// Retry strategy for metadata requests.
///
/// Retries on:
/// - Transient network errors (timeouts, connection failures)
/// - 5xx server errors
/// - 429 rate limiting
///
/// Does NOT retry other 4xx responses. Every request is a GET, so retrying is
/// always safe.
struct TransientRetryStrategy;

impl RetryableStrategy for TransientRetryStrategy {
    fn handle(&self, res: &reqwest_middleware::Result<reqwest::Response>) -> Option<Retryable> {
        match res {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    Some(Retryable::Transient)
                } else if status.is_success() {
                    None
                } else {
                    Some(Retryable::Fatal)
                }
            }
            Err(error) => {
                if error.is_timeout() || error.is_connect() {
                    Some(Retryable::Transient)
                } else {
                    Some(Retryable::Fatal)
                }
            }
        }
    }
}

/// Arc-wrapped client for shared ownership.
pub type SharedClient = Arc<ODataClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_rejects_invalid_config() {
        let mut config = ClientConfig::default();
        config.page_size = 0;
        assert!(ODataClient::new(config).is_err());
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(
            ODataClient::parse_retry_after(&headers),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_parse_retry_after_past_date() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(
            ODataClient::parse_retry_after(&headers),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_missing_or_invalid() {
        assert_eq!(ODataClient::parse_retry_after(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(ODataClient::parse_retry_after(&headers), None);
    }

    #[test]
    fn test_status_mapping() {
        let err = ODataClient::status_to_error(StatusCode::NOT_FOUND, "gone".into(), None, None);
        assert!(matches!(err, ClientError::NotFound(_)));

        let err = ODataClient::status_to_error(StatusCode::BAD_REQUEST, "bad".into(), None, None);
        assert!(matches!(err, ClientError::BadRequest { status: 400, .. }));
        assert!(!err.is_retryable());

        let err =
            ODataClient::status_to_error(StatusCode::BAD_GATEWAY, "proxy".into(), None, None);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_odata_error_message() {
        let body = br#"{"odata.error":{"code":"","message":{"lang":"en-US","value":"Syntax error at position 12."}}}"#;
        assert_eq!(
            odata_error_message(body).as_deref(),
            Some("Syntax error at position 12.")
        );
        assert_eq!(odata_error_message(b"<html/>"), None);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
