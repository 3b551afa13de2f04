use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};

use crate::CacheCategory;

/// Default number of retries after a failed attempt
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default upper bound of a retry delay
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default lifetime of cached responses
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Default deadline of one submission
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of cached responses
const DEFAULT_MAX_CACHE_ENTRIES: usize = 1024;

/// Behaviour of a [`crate::Governor`]: retries, caching and deadlines.
///
/// Can be deserialized from a configuration file. Durations are written
/// in humantime format, e.g. `500ms` or `2m`.
///
/// ```
/// use std::time::Duration;
/// use prc_lib::GovernorConfig;
///
/// let config: GovernorConfig = serde_json::from_str(
///     r#"{ "max_retries": 5, "cache_ttls": { "vehicles": "10m" } }"#,
/// ).unwrap();
/// assert_eq!(config.max_retries, 5);
/// assert_eq!(config.ttl_for(&"vehicles".into()), Duration::from_secs(600));
/// assert_eq!(config.ttl_for(&"players".into()), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernorConfig {
    /// Retries after the first attempt before a 429, 5xx or network failure
    /// is reported to the caller
    pub max_retries: u32,

    /// Delay before the first retry of a 5xx or network failure
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Upper bound of a retry delay
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Lifetime of cached responses without a category override
    #[serde(with = "humantime_serde")]
    pub default_cache_ttl: Duration,

    /// Lifetime of cached responses per cache category.
    /// A zero duration disables caching for that category.
    #[serde(
        deserialize_with = "deserialize_ttls",
        serialize_with = "serialize_ttls"
    )]
    pub cache_ttls: HashMap<CacheCategory, Duration>,

    /// Deadline of one submission, from submit until a result is available
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum number of cached responses
    pub max_cache_entries: usize,

    /// Minimum interval between two dispatches on the same bucket
    #[serde(with = "humantime_serde")]
    pub request_interval: Option<Duration>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            default_cache_ttl: DEFAULT_CACHE_TTL,
            cache_ttls: HashMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            request_interval: None,
        }
    }
}

impl GovernorConfig {
    /// Cache lifetime of responses in `category`
    #[must_use]
    pub fn ttl_for(&self, category: &CacheCategory) -> Duration {
        self.cache_ttls
            .get(category)
            .copied()
            .unwrap_or(self.default_cache_ttl)
    }

    /// Override the cache lifetime of one category
    #[must_use]
    pub fn with_ttl(mut self, category: impl Into<CacheCategory>, ttl: Duration) -> Self {
        self.cache_ttls.insert(category.into(), ttl);
        self
    }
}

fn deserialize_ttls<'de, D>(deserializer: D) -> Result<HashMap<CacheCategory, Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let map = HashMap::<String, String>::deserialize(deserializer)?;
    map.into_iter()
        .map(|(category, ttl)| {
            humantime::parse_duration(&ttl)
                .map(|ttl| (CacheCategory::from(category.as_str()), ttl))
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "Invalid cache TTL '{ttl}' for category '{category}': {e}"
                    ))
                })
        })
        .collect()
}

fn serialize_ttls<S>(ttls: &HashMap<CacheCategory, Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let map: BTreeMap<&str, String> = ttls
        .iter()
        .map(|(category, ttl)| {
            (
                category.as_str(),
                humantime::format_duration(*ttl).to_string(),
            )
        })
        .collect();
    map.serialize(serializer)
}
