use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota as PaceQuota, RateLimiter};
use http::HeaderMap;
use tokio::time::Instant;

use super::BucketKey;
use crate::time;
use super::headers::{Quota, parse_quota};

/// How long a bucket reported as exhausted is held when the server does
/// not say when it resets
const UNKNOWN_RESET_WINDOW: Duration = Duration::from_secs(1);

/// Rate limit state of one bucket as last reported by the server.
///
/// Until the first response has been observed a bucket is optimistic:
/// requests are let through without waiting. A bucket the server reports
/// as exhausted without a reset time is held for one second.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    /// Requests allowed per window
    pub limit: Option<usize>,
    /// Requests left in the current window
    pub remaining: Option<usize>,
    /// When the current window ends
    pub reset_at: Option<Instant>,
    /// When the server last reported on this bucket
    pub last_updated_at: Option<Instant>,
}

impl Bucket {
    /// Whether the server has reported on this bucket yet
    #[must_use]
    pub const fn is_observed(&self) -> bool {
        self.last_updated_at.is_some()
    }
}

/// Outcome of [`RateLimitTracker::reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// A request may be sent now; one unit of quota was consumed
    Granted,
    /// Nothing may be sent on this bucket before the given instant
    Wait(Instant),
}

/// Measures time on tokio's clock, so pacing follows paused time in tests
#[derive(Debug, Clone)]
struct TokioClock {
    origin: Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Instant::now().saturating_duration_since(self.origin)
    }
}

type Pacer = RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<Duration>>;

/// Tracks remote rate limit state per bucket and per server key.
///
/// The server's numbers always win: local bookkeeping only decrements
/// `remaining` between observations.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    buckets: DashMap<BucketKey, Bucket>,
    /// Server ids blocked as a whole by a global 429
    servers: DashMap<String, Instant>,
    /// Optional minimum interval between two dispatches of one bucket
    request_interval: Option<Duration>,
    pacers: DashMap<BucketKey, Arc<Pacer>>,
    clock: TokioClock,
}

impl RateLimitTracker {
    /// Create a tracker, optionally spacing dispatches of a bucket by
    /// at least `request_interval`
    #[must_use]
    pub fn new(request_interval: Option<Duration>) -> Self {
        Self {
            request_interval: request_interval.filter(|i| !i.is_zero()),
            ..Self::default()
        }
    }

    /// Ask for permission to send one request on `key`.
    ///
    /// Returns immediately with [`Reservation::Granted`] while quota is left
    /// or the bucket has never been observed, consuming one unit.
    /// Otherwise returns the instant the caller should wait for.
    pub fn reserve(&self, key: &BucketKey) -> Reservation {
        let now = Instant::now();

        if let Some(until) = self.server_blocked_until(key.server(), now) {
            return Reservation::Wait(until);
        }

        let mut bucket = self.buckets.entry(key.clone()).or_default();

        if let Some(reset_at) = bucket.reset_at
            && reset_at <= now
        {
            // The window is over, so the full limit is available again.
            // An unknown limit makes the bucket optimistic.
            bucket.remaining = bucket.limit;
            bucket.reset_at = None;
        }

        if bucket.remaining == Some(0)
            && let Some(reset_at) = bucket.reset_at
        {
            return Reservation::Wait(reset_at);
        }

        if let Some(wait) = self.pace(key) {
            return Reservation::Wait(time::after(now, wait));
        }

        bucket.remaining = bucket.remaining.map(|r| r.saturating_sub(1));
        Reservation::Granted
    }

    /// Update a bucket from the quota headers of a response
    pub fn observe(&self, key: &BucketKey, headers: &HeaderMap) {
        self.observe_quota(key, &parse_quota(headers));
    }

    pub(crate) fn observe_quota(&self, key: &BucketKey, quota: &Quota) {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.clone()).or_default();

        if quota.limit.is_some() {
            bucket.limit = quota.limit;
        }
        if quota.remaining.is_some() {
            bucket.remaining = quota.remaining;
        }
        if let Some(reset_after) = quota.reset_after {
            bucket.reset_at = Some(time::after(now, reset_after));
        } else if bucket.remaining == Some(0) && bucket.reset_at.is_none_or(|at| at <= now) {
            bucket.reset_at = Some(now + UNKNOWN_RESET_WINDOW);
        }
        bucket.last_updated_at = Some(now);
    }

    /// Record a 429 response.
    ///
    /// The server's retry delay replaces any reset estimate of the bucket.
    /// With `global` set, every bucket of the same server waits as well.
    pub fn rate_limited(&self, key: &BucketKey, retry_after: Duration, global: bool) {
        let now = Instant::now();
        let until = time::after(now, retry_after);
        {
            let mut bucket = self.buckets.entry(key.clone()).or_default();
            bucket.remaining = Some(0);
            bucket.reset_at = Some(until);
            bucket.last_updated_at = Some(now);
        }

        if global {
            log::debug!(
                "Server {} is globally rate limited for {}ms",
                key.server(),
                retry_after.as_millis()
            );
            self.servers.insert(key.server().to_string(), until);
        }
    }

    /// Snapshot of the state of a bucket
    #[must_use]
    pub fn bucket(&self, key: &BucketKey) -> Option<Bucket> {
        self.buckets.get(key).map(|b| b.clone())
    }

    fn server_blocked_until(&self, server: &str, now: Instant) -> Option<Instant> {
        let until = *self.servers.get(server)?;
        if until > now {
            Some(until)
        } else {
            self.servers.remove_if(server, |_, until| *until <= now);
            None
        }
    }

    /// Check the request interval of a bucket, returning how long to wait
    fn pace(&self, key: &BucketKey) -> Option<Duration> {
        let interval = self.request_interval?;
        let pacer = self
            .pacers
            .entry(key.clone())
            .or_insert_with(|| {
                let quota = PaceQuota::with_period(interval)
                    .unwrap_or_else(|| PaceQuota::per_second(NonZeroU32::MIN))
                    .allow_burst(NonZeroU32::MIN);
                Arc::new(RateLimiter::direct_with_clock(quota, self.clock.clone()))
            })
            .clone();

        pacer
            .check()
            .err()
            .map(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}
