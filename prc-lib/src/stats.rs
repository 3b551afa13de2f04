//! Per-bucket request statistics.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::ser::SerializeStruct;

use crate::BucketKey;

/// Number of request times kept for the median
const REQUEST_TIME_WINDOW: usize = 100;

/// What a [`crate::Governor`] observed for a single bucket
#[derive(Debug, Clone, Default)]
pub struct BucketStats {
    /// Requests that went over the wire, including retries
    pub upstream_requests: u64,
    /// Responses with a 2xx status
    pub successes: u64,
    /// Responses with status 429
    pub rate_limited: u64,
    /// Responses with a 5xx status
    pub server_errors: u64,
    /// Responses with a 4xx status other than 429
    pub client_errors: u64,
    /// Attempts that failed below HTTP
    pub network_errors: u64,
    /// Submissions answered from the cache
    pub cache_hits: u64,
    /// Cacheable submissions that missed the cache
    pub cache_misses: u64,
    /// Submissions that joined an identical request already in flight
    pub coalesced: u64,
    request_times: VecDeque<Duration>,
}

impl BucketStats {
    /// Record a response with status code and request duration
    pub fn record_response(&mut self, status_code: u16, request_time: Duration) {
        self.upstream_requests += 1;
        match status_code {
            200..=299 => self.successes += 1,
            429 => self.rate_limited += 1,
            400..=499 => self.client_errors += 1,
            500..=599 => self.server_errors += 1,
            _ => {}
        }
        self.push_request_time(request_time);
    }

    /// Record an attempt that failed without a response
    pub fn record_network_error(&mut self, request_time: Duration) {
        self.upstream_requests += 1;
        self.network_errors += 1;
        self.push_request_time(request_time);
    }

    fn push_request_time(&mut self, request_time: Duration) {
        if self.request_times.len() >= REQUEST_TIME_WINDOW {
            self.request_times.pop_front();
        }
        self.request_times.push_back(request_time);
    }

    /// Median of the most recent request times
    #[must_use]
    pub fn median_request_time(&self) -> Option<Duration> {
        if self.request_times.is_empty() {
            return None;
        }

        let mut times: Vec<_> = self.request_times.iter().copied().collect();
        times.sort();
        let mid = times.len() / 2;

        if times.len().is_multiple_of(2) {
            Some((times[mid - 1] + times[mid]) / 2)
        } else {
            Some(times[mid])
        }
    }

    /// Share of cacheable submissions answered from the cache (0.0 to 1.0)
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = self.cache_hits as f64 / lookups as f64;
            rate
        }
    }

    /// One-line human readable summary
    #[must_use]
    pub fn summary(&self) -> String {
        let median = self
            .median_request_time()
            .map_or_else(|| "N/A".to_string(), |d| format!("{}ms", d.as_millis()));
        format!(
            "{} upstream ({} ok, {} limited, {} failed), {} cached, {} coalesced, median: {}",
            self.upstream_requests,
            self.successes,
            self.rate_limited,
            self.server_errors + self.client_errors + self.network_errors,
            self.cache_hits,
            self.coalesced,
            median
        )
    }
}

impl Serialize for BucketStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let median_request_time_ms = self.median_request_time().map(|d| d.as_millis());

        let mut s = serializer.serialize_struct("BucketStats", 11)?;
        s.serialize_field("upstream_requests", &self.upstream_requests)?;
        s.serialize_field("successes", &self.successes)?;
        s.serialize_field("rate_limited", &self.rate_limited)?;
        s.serialize_field("server_errors", &self.server_errors)?;
        s.serialize_field("client_errors", &self.client_errors)?;
        s.serialize_field("network_errors", &self.network_errors)?;
        s.serialize_field("cache_hits", &self.cache_hits)?;
        s.serialize_field("cache_misses", &self.cache_misses)?;
        s.serialize_field("cache_hit_rate", &self.cache_hit_rate())?;
        s.serialize_field("coalesced", &self.coalesced)?;
        s.serialize_field("median_request_time_ms", &median_request_time_ms)?;
        s.end()
    }
}

/// Concurrent collection of [`BucketStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    buckets: DashMap<BucketKey, BucketStats>,
}

impl StatsRecorder {
    pub(crate) fn update(&self, key: &BucketKey, f: impl FnOnce(&mut BucketStats)) {
        f(&mut self.buckets.entry(key.clone()).or_default());
    }

    pub(crate) fn get(&self, key: &BucketKey) -> BucketStats {
        self.buckets
            .get(key)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub(crate) fn all(&self) -> HashMap<BucketKey, BucketStats> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
