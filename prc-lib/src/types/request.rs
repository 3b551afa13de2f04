use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, Result, ServerKey};

/// Name of a group of cacheable requests sharing one TTL,
/// e.g. `players` (short lived) or `vehicles` (long lived).
///
/// TTLs are looked up per category in [`crate::GovernorConfig::cache_ttls`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheCategory(String);

impl CacheCategory {
    /// Get the category name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CacheCategory {
    fn default() -> Self {
        Self::from("default")
    }
}

impl From<&str> for CacheCategory {
    fn from(name: &str) -> Self {
        Self(name.to_lowercase())
    }
}

impl From<String> for CacheCategory {
    fn from(name: String) -> Self {
        Self(name.to_lowercase())
    }
}

impl Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque, logical request against one server of the PRC API.
///
/// The endpoint layer builds descriptors; the [`crate::Governor`] only uses
/// them to derive a bucket, a de-duplication key and the wire request.
/// Query parameters are kept sorted, so two descriptors that differ only in
/// the order their parameters were added are the same request.
///
/// ```
/// use prc_lib::{RequestDescriptor, ServerKey};
///
/// let key: ServerKey = format!("{}-{}", "a".repeat(10), "b".repeat(40)).parse().unwrap();
/// let a = RequestDescriptor::get(key.clone(), "/server/players").unwrap()
///     .with_param("b", "2")
///     .with_param("a", "1");
/// let b = RequestDescriptor::get(key, "server/players/").unwrap()
///     .with_param("a", "1")
///     .with_param("b", "2");
/// assert_eq!(a.dedupe_key(), b.dedupe_key());
/// ```
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    server_key: ServerKey,
    method: Method,
    route: String,
    params: BTreeMap<String, String>,
    body: Option<Arc<[u8]>>,
    headers: HeaderMap,
    cacheable: bool,
    cache_category: CacheCategory,
    use_global_key: bool,
}

impl RequestDescriptor {
    /// Create a descriptor for `method` on `route`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidRoute`] if the route is empty or carries
    /// a query string or fragment. Parameters are added with
    /// [`RequestDescriptor::with_param`] instead.
    pub fn new(server_key: ServerKey, method: Method, route: &str) -> Result<Self> {
        Ok(Self {
            server_key,
            method,
            route: normalize_route(route)?,
            params: BTreeMap::new(),
            body: None,
            headers: HeaderMap::new(),
            cacheable: false,
            cache_category: CacheCategory::default(),
            use_global_key: true,
        })
    }

    /// Shorthand for a `GET` descriptor
    ///
    /// # Errors
    ///
    /// See [`RequestDescriptor::new`].
    pub fn get(server_key: ServerKey, route: &str) -> Result<Self> {
        Self::new(server_key, Method::GET, route)
    }

    /// Shorthand for a `POST` descriptor with a JSON body
    ///
    /// # Errors
    ///
    /// Fails on an invalid route (see [`RequestDescriptor::new`]) or if the
    /// body cannot be serialized.
    pub fn post_json<T: Serialize>(server_key: ServerKey, route: &str, body: &T) -> Result<Self> {
        let body = serde_json::to_vec(body).map_err(|e| ErrorKind::InvalidBody(e.to_string()))?;
        let mut descriptor = Self::new(server_key, Method::POST, route)?;
        descriptor.body = Some(body.into());
        Ok(descriptor)
    }

    /// Add a query parameter. Adding the same name twice keeps the last value.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Add an extra header to the wire request.
    ///
    /// Headers do not take part in de-duplication.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Mark the response as cacheable under `category`
    #[must_use]
    pub fn cacheable(mut self, category: impl Into<CacheCategory>) -> Self {
        self.cacheable = true;
        self.cache_category = category.into();
        self
    }

    /// Do not send the global API key with this request
    #[must_use]
    pub const fn without_global_key(mut self) -> Self {
        self.use_global_key = false;
        self
    }

    /// The key of the server this request targets
    #[must_use]
    pub const fn server_key(&self) -> &ServerKey {
        &self.server_key
    }

    /// HTTP method
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Normalized route, always starting with `/` and never ending with one
    #[must_use]
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Query parameters in sorted order
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialized request body, if any
    #[must_use]
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Extra headers set by the endpoint layer
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether successful responses may be cached
    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// The cache category used to pick a TTL
    #[must_use]
    pub const fn cache_category(&self) -> &CacheCategory {
        &self.cache_category
    }

    /// Whether the global API key should be attached
    #[must_use]
    pub const fn uses_global_key(&self) -> bool {
        self.use_global_key
    }

    /// Identity of this request for caching and single-flight de-duplication.
    #[must_use]
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            server: self.server_key.digest(),
            method: self.method.clone(),
            route: self.route.clone(),
            params: self
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: self.body.clone(),
        }
    }
}

fn normalize_route(route: &str) -> Result<String> {
    let trimmed = route.trim().trim_matches('/');
    if route.trim().is_empty() || trimmed.contains(['?', '#']) || trimmed.contains("//") {
        return Err(ErrorKind::InvalidRoute(route.to_string()));
    }
    Ok(format!("/{trimmed}"))
}

/// Identity of a logical request: server key, method, route, sorted
/// parameters and body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    server: u64,
    method: Method,
    route: String,
    params: Vec<(String, String)>,
    body: Option<Arc<[u8]>>,
}

impl Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.route)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}
