use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::transport::TransportError;
use crate::{ApiError, BucketKey};

/// Possible errors when submitting requests through a [`crate::Governor`].
///
/// Terminal errors of a dispatched request are delivered verbatim to every
/// caller waiting on that request, which is why this type is [`Clone`].
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The request was rejected with a non-retryable 4xx status.
    /// Malformed requests and permission problems end up here.
    #[error("Request rejected with status {status}{}", api_suffix(.api_error))]
    ClientError {
        /// Status returned by the server
        status: StatusCode,
        /// Decoded error body, if the server sent one
        api_error: Option<ApiError>,
    },
    /// The server kept answering with 429 until the retry ceiling was hit
    #[error("Rate limit of bucket {bucket} still exceeded after {attempts} attempts")]
    RateLimitExceeded {
        /// Bucket which was limited
        bucket: BucketKey,
        /// Number of attempts made
        attempts: u32,
        /// Last retry delay requested by the server
        retry_after: Option<Duration>,
    },
    /// The server kept failing with 5xx until the retry ceiling was hit
    #[error("Server error {status} after {attempts} attempts{}", api_suffix(.api_error))]
    ServerError {
        /// Last status returned by the server
        status: StatusCode,
        /// Number of attempts made
        attempts: u32,
        /// Decoded error body of the last response, if any
        api_error: Option<ApiError>,
    },
    /// The transport kept failing until the retry ceiling was hit
    #[error("Network error after {attempts} attempts: {source}")]
    NetworkError {
        /// Number of attempts made
        attempts: u32,
        /// Last transport error
        source: Arc<TransportError>,
    },
    /// The caller's deadline passed before a result was available.
    /// Only the caller that timed out sees this error.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// The request was dropped before it produced a result
    #[error("Request was cancelled before a result was available")]
    Cancelled,
    /// A server key did not match the expected format
    #[error("Invalid server-key format")]
    InvalidServerKey,
    /// A route could not be used to build a request
    #[error("Invalid route `{0}`")]
    InvalidRoute(String),
    /// A body could not be serialized or deserialized
    #[error("Invalid body: {0}")]
    InvalidBody(String),
    /// A configured header value contains characters not allowed in HTTP
    #[error("Invalid header value `{0}`")]
    InvalidHeader(String),
    /// The configured base URL cannot be used
    #[error("Invalid base URL `{0}`")]
    InvalidBaseUrl(String),
    /// The HTTP client could not be built
    #[error("Failed to build the HTTP client: {0}")]
    BuildClient(Arc<reqwest::Error>),
}

fn api_suffix(api_error: &Option<ApiError>) -> String {
    api_error
        .as_ref()
        .map(|e| format!(": {e}"))
        .unwrap_or_default()
}

impl ErrorKind {
    /// The HTTP status that caused this error, if there was one
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::ClientError { status, .. } | Self::ServerError { status, .. } => Some(*status),
            Self::RateLimitExceeded { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            _ => None,
        }
    }

    /// The decoded API error body, if there was one
    #[must_use]
    pub const fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::ClientError { api_error, .. } | Self::ServerError { api_error, .. } => {
                api_error.as_ref()
            }
            _ => None,
        }
    }
}

/// The result type used throughout `prc_lib`
pub type Result<T> = std::result::Result<T, ErrorKind>;
