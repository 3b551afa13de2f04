use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::{ErrorKind, Result};

/// The raw result of a request: status, headers and body bytes.
///
/// A response can be shared by many waiters of the same logical request and
/// by the cache, so cloning is cheap.
/// Decoding into typed domain objects is left to the caller.
#[derive(Debug, Clone)]
pub struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Arc<[u8]>,
}

impl RawResponse {
    /// Create a new raw response
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Arc<[u8]>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// HTTP status code
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw body bytes
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidBody`] if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| ErrorKind::InvalidBody(e.to_string()))
    }

    /// Returns `true` if two responses share the same body allocation
    #[must_use]
    pub fn shares_body_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}
