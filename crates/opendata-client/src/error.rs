//! Error types for the open-data client.

use opendata_core::{CatalogError, FetchCursor, SinkError};
use std::time::Duration;

/// Errors that can occur when using the open-data client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP transport error (connection, DNS, TLS, timeout, etc.)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport error surfaced through the retry middleware
    #[error("HTTP request error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// Dataset, dimension or catalog entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication failed (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Permission denied (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request rejected as malformed (other 4xx)
    #[error("Bad request ({status}): {message}")]
    BadRequest { status: u16, message: String },

    /// Rate limited (429)
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Optional retry-after duration from server
        retry_after: Option<Duration>,
        /// Request ID for tracking
        request_id: Option<String>,
    },

    /// Server error (5xx)
    #[error("Server error ({status}): {message}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Error message from server
        message: String,
        /// Request ID for tracking
        request_id: Option<String>,
    },

    /// Response body did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Metadata the resolver could not interpret
    #[error("Unexpected schema for dataset '{dataset_id}': {field}")]
    Schema { dataset_id: String, field: String },

    /// Filter references an unknown column or is malformed
    #[error("Invalid filter for dataset '{dataset_id}': {message}")]
    InvalidFilter { dataset_id: String, message: String },

    /// Projection names a column the dataset does not have
    #[error("Unknown column '{column}' in dataset '{dataset_id}'")]
    InvalidColumn { dataset_id: String, column: String },

    /// A page request failed and the fetch stopped
    #[error("Fetching '{dataset_id}' failed at offset {offset} after {attempts} attempt(s): {cause}")]
    PageFetch {
        dataset_id: String,
        offset: u64,
        attempts: u32,
        cause: Box<ClientError>,
        /// Position after the last batch the sink accepted
        cursor: Box<FetchCursor>,
    },

    /// The sink rejected a batch
    #[error("Sink rejected batch at offset {offset} of '{dataset_id}': {source}")]
    Sink {
        dataset_id: String,
        offset: u64,
        #[source]
        source: SinkError,
        /// Position after the last batch the sink accepted
        cursor: Box<FetchCursor>,
    },

    /// A code had no vocabulary entry under the `fail` policy
    #[error("No label for code '{code}' of dimension '{dimension}' in dataset '{dataset_id}'")]
    Translation {
        dataset_id: String,
        dimension: String,
        code: String,
    },

    /// Translating a batch failed before it reached the sink
    #[error("Translating batch at offset {offset} of '{dataset_id}' failed: {source}")]
    BatchTranslation {
        dataset_id: String,
        offset: u64,
        #[source]
        source: Box<ClientError>,
        /// Position after the last batch the sink accepted
        cursor: Box<FetchCursor>,
    },

    /// Request validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local store error
    #[error("Store error: {0}")]
    Store(CatalogError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<CatalogError> for ClientError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::DatasetNotFound(id) => ClientError::NotFound(id),
            CatalogError::SchemaError { dataset_id, field } => {
                ClientError::Schema { dataset_id, field }
            }
            CatalogError::ValidationError(msg) => ClientError::Validation(msg),
            other => ClientError::Store(other),
        }
    }
}

impl ClientError {
    /// Returns true if this error is transient and the request may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::RateLimited { .. } => true,
            ClientError::ServerError { status, .. } => *status >= 500,
            ClientError::Http(e) => e.is_timeout() || e.is_connect(),
            ClientError::HttpMiddleware(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientError::RateLimited { request_id, .. } => request_id.as_deref(),
            ClientError::ServerError { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// Cursor to resume from, for errors raised mid-fetch.
    pub fn cursor(&self) -> Option<&FetchCursor> {
        match self {
            ClientError::PageFetch { cursor, .. }
            | ClientError::Sink { cursor, .. }
            | ClientError::BatchTranslation { cursor, .. } => Some(cursor.as_ref()),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use opendata_core::QuerySpec;

    #[test]
    fn test_retryable_errors() {
        let rate_limited = ClientError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
            request_id: Some("req-123".to_string()),
        };
        assert!(rate_limited.is_retryable());
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(60)));

        let server_error = ClientError::ServerError {
            status: 503,
            message: "Service unavailable".to_string(),
            request_id: None,
        };
        assert!(server_error.is_retryable());

        let bad_request = ClientError::BadRequest {
            status: 400,
            message: "Syntax error at position 7".to_string(),
        };
        assert!(!bad_request.is_retryable());
        assert!(!ClientError::NotFound("85313NED".to_string()).is_retryable());
    }

    #[test]
    fn test_request_id_extraction() {
        let error = ClientError::RateLimited {
            retry_after: None,
            request_id: Some("req-456".to_string()),
        };
        assert_eq!(error.request_id(), Some("req-456"));
        assert_eq!(ClientError::NotFound("x".to_string()).request_id(), None);
    }

    #[test]
    fn test_catalog_error_mapping() {
        let err: ClientError = CatalogError::DatasetNotFound("85313NED".into()).into();
        assert!(matches!(err, ClientError::NotFound(id) if id == "85313NED"));

        let err: ClientError = CatalogError::SchemaError {
            dataset_id: "85313NED".into(),
            field: "Type".into(),
        }
        .into();
        assert!(matches!(err, ClientError::Schema { .. }));

        let err: ClientError = CatalogError::Other("disk full".into()).into();
        assert!(matches!(err, ClientError::Store(_)));
    }

    #[test]
    fn test_page_fetch_exposes_cursor() {
        let mut cursor = FetchCursor::start(QuerySpec::new("85313NED"));
        cursor.offset = 3000;
        let err = ClientError::PageFetch {
            dataset_id: "85313NED".into(),
            offset: 3000,
            attempts: 4,
            cause: Box::new(ClientError::ServerError {
                status: 502,
                message: "Bad gateway".into(),
                request_id: None,
            }),
            cursor: Box::new(cursor),
        };
        assert_eq!(err.cursor().map(|c| c.offset), Some(3000));
        assert!(err.to_string().contains("offset 3000"));
    }
}
