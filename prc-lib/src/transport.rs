//! The wire side of the [`crate::Governor`].
//!
//! Everything above this module deals in [`RequestDescriptor`]s and
//! [`RawResponse`]s. A [`Transport`] turns one into the other.

use std::fmt;
use std::io;

use async_trait::async_trait;
use http::HeaderValue;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

use crate::{RawResponse, RequestDescriptor};

/// Base URL of the public PRC API
pub const DEFAULT_BASE_URL: &str = "https://api.policeroleplay.community/v1";

/// Header carrying the per-server API key
pub const SERVER_KEY_HEADER: &str = "server-key";

/// A request failed below HTTP: no status code was received
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// The HTTP client failed to send the request or read the response
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    /// The connection failed
    #[error("{0}")]
    Io(#[from] io::Error),
    /// The route and base URL do not form a valid URL
    #[error("Cannot build a URL for route `{0}`")]
    InvalidUrl(String),
    /// A header value contained characters not allowed in HTTP
    #[error("Invalid header value for `{0}`")]
    InvalidHeader(&'static str),
}

/// Sends one attempt of a request over the wire.
///
/// Implementations must not retry on their own. Retries, pacing and
/// rate limiting are handled by the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the request and read the full response
    async fn send(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError>;
}

/// [`Transport`] backed by a [`reqwest::Client`]
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
    global_key: Option<SecretString>,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("base_url", &self.base_url.as_str())
            .field("global_key", &self.global_key.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    /// Create a transport sending requests relative to `base_url`.
    ///
    /// `global_key` is sent as `Authorization` header with every request
    /// which does not opt out of it.
    #[must_use]
    pub const fn new(client: Client, base_url: Url, global_key: Option<SecretString>) -> Self {
        Self {
            client,
            base_url,
            global_key,
        }
    }

    /// Full URL of a request, including its query parameters
    pub fn url(&self, request: &RequestDescriptor) -> Result<Url, TransportError> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            request.route().trim_start_matches('/')
        );
        let mut url =
            Url::parse(&joined).map_err(|_| TransportError::InvalidUrl(request.route().into()))?;

        let mut params = request.params().peekable();
        if params.peek().is_some() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        let url = self.url(request)?;
        let server_key = HeaderValue::from_str(request.server_key().expose())
            .map_err(|_| TransportError::InvalidHeader(SERVER_KEY_HEADER))?;

        let mut builder = self
            .client
            .request(request.method().clone(), url)
            .header(SERVER_KEY_HEADER, server_key);

        if request.uses_global_key()
            && let Some(global_key) = &self.global_key
        {
            let value = HeaderValue::from_str(global_key.expose_secret())
                .map_err(|_| TransportError::InvalidHeader("authorization"))?;
            builder = builder.header(AUTHORIZATION, value);
        }

        builder = builder.headers(request.headers().clone());

        if let Some(body) = request.body() {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(RawResponse::new(status, headers, body.to_vec()))
    }
}
