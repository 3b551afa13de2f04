use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use http::HeaderValue;
use http::header::{self, HeaderMap};
use secrecy::SecretString;
use tokio::time::{Instant, sleep_until, timeout_at};
use typed_builder::TypedBuilder;
use url::Url;

use crate::cache::{CacheStore, Flight, InFlight, ItemId};
use crate::dispatch::{Dispatched, Dispatcher, RejectedKeys};
use crate::queue::{Front, QueueItem, RequestQueue};
use crate::stats::StatsRecorder;
use crate::transport::{DEFAULT_BASE_URL, ReqwestTransport, Transport};
use crate::{
    Bucket, BucketKey, BucketKeyResolver, BucketStats, DedupeKey, ErrorKind, GovernorConfig,
    RateLimitTracker, RawResponse, RequestDescriptor, Reservation, Result, RouteBuckets,
};

/// Default user agent, `prc/<PKG_VERSION>`.
pub const DEFAULT_USER_AGENT: &str = concat!("prc/", env!("CARGO_PKG_VERSION"));

/// Builder for [`Governor`].
///
/// See crate-level documentation for usage example.
#[derive(TypedBuilder, Clone)]
#[builder(field_defaults(default))]
#[builder(builder_method(doc = "
Create a builder for building `GovernorBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `GovernorBuilder`.
"))]
pub struct GovernorBuilder {
    /// Retry, caching and deadline settings
    config: GovernorConfig,
    /// Sends requests over the wire.
    ///
    /// Defaults to a [`ReqwestTransport`] built from the fields below.
    #[builder(setter(strip_option))]
    transport: Option<Arc<dyn Transport>>,
    /// Maps requests to rate limit buckets
    #[builder(default = Arc::new(RouteBuckets) as Arc<dyn BucketKeyResolver>)]
    resolver: Arc<dyn BucketKeyResolver>,
    /// Base URL of the API
    #[builder(default_code = "String::from(DEFAULT_BASE_URL)", setter(into))]
    base_url: String,
    /// Global API key sent as `Authorization` header.
    ///
    /// Only needed for large scale applications, see the API documentation.
    #[builder(setter(into))]
    global_key: Option<SecretString>,
    /// User-agent sent with every request
    #[builder(default_code = "String::from(DEFAULT_USER_AGENT)", setter(into))]
    user_agent: String,
    /// Timeout of a single HTTP attempt.
    /// This is not the deadline of a submission, see [`GovernorConfig::request_timeout`].
    #[builder(setter(into))]
    timeout: Option<Duration>,
}

impl Default for GovernorBuilder {
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for GovernorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernorBuilder")
            .field("config", &self.config)
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GovernorBuilder {
    /// Instantiates a [`Governor`].
    ///
    /// # Errors
    ///
    /// Returns an `Err` if:
    /// - The base URL is not a valid URL.
    /// - The user agent contains characters not allowed in a header.
    /// - The HTTP client cannot be built.
    pub fn governor(self) -> Result<Governor> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(Self::reqwest_transport(
                &self.base_url,
                &self.user_agent,
                self.timeout,
                self.global_key,
            )?),
        };

        let config = self.config;
        let tracker = Arc::new(RateLimitTracker::new(config.request_interval));
        let cache = Arc::new(CacheStore::new(config.max_cache_entries));
        let stats = Arc::new(StatsRecorder::default());
        let rejected = Arc::new(RejectedKeys::default());

        let dispatcher = Dispatcher {
            transport,
            tracker: Arc::clone(&tracker),
            cache: Arc::clone(&cache),
            stats: Arc::clone(&stats),
            rejected: Arc::clone(&rejected),
            config: config.clone(),
        };

        Ok(Governor {
            inner: Arc::new(Inner {
                resolver: self.resolver,
                inflight: Arc::new(InFlight::default()),
                queue: RequestQueue::default(),
                dispatcher,
                tracker,
                cache,
                stats,
                rejected,
                request_timeout: config.request_timeout,
            }),
        })
    }

    fn reqwest_transport(
        base_url: &str,
        user_agent: &str,
        timeout: Option<Duration>,
        global_key: Option<SecretString>,
    ) -> Result<ReqwestTransport> {
        let base_url =
            Url::parse(base_url).map_err(|_| ErrorKind::InvalidBaseUrl(base_url.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|_| ErrorKind::InvalidHeader(user_agent.to_string()))?,
        );

        let builder = reqwest::ClientBuilder::new()
            .gzip(true)
            .default_headers(headers);

        let client = (match timeout {
            Some(t) => builder.timeout(t),
            None => builder,
        })
        .build()
        .map_err(|e| ErrorKind::BuildClient(Arc::new(e)))?;

        Ok(ReqwestTransport::new(client, base_url, global_key))
    }
}

struct Inner {
    resolver: Arc<dyn BucketKeyResolver>,
    inflight: Arc<InFlight>,
    queue: RequestQueue,
    dispatcher: Dispatcher,
    tracker: Arc<RateLimitTracker>,
    cache: Arc<CacheStore>,
    stats: Arc<StatsRecorder>,
    rejected: Arc<RejectedKeys>,
    request_timeout: Duration,
}

/// Entry point for sending requests to the PRC API.
///
/// Every submission goes through the same pipeline: cache lookup,
/// single-flight de-duplication, the FIFO queue of its rate limit bucket
/// and finally the [`Transport`]. Each bucket with pending requests is
/// drained by its own task, which stops once the queue is empty.
///
/// A `Governor` is cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Governor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Governor")
            .field("cached", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

impl Governor {
    /// Submit a request and wait for its result, giving up after the
    /// configured [`GovernorConfig::request_timeout`].
    ///
    /// # Errors
    ///
    /// See [`ErrorKind`]. [`ErrorKind::Timeout`] is only seen by this
    /// caller; the request itself keeps going for other waiters.
    pub async fn submit(&self, descriptor: RequestDescriptor) -> Result<RawResponse> {
        match Instant::now().checked_add(self.inner.request_timeout) {
            Some(deadline) => self.submit_until(descriptor, deadline).await,
            // Too far out to be reached
            None => self.resolve(descriptor).await,
        }
    }

    /// Submit a request and wait for its result until `deadline`.
    ///
    /// Dropping the returned future before it completes withdraws the
    /// request, unless it has already been sent or other callers wait for
    /// the same request.
    ///
    /// # Errors
    ///
    /// See [`Governor::submit`].
    pub async fn submit_until(
        &self,
        descriptor: RequestDescriptor,
        deadline: Instant,
    ) -> Result<RawResponse> {
        let budget = deadline.saturating_duration_since(Instant::now());
        timeout_at(deadline, self.resolve(descriptor))
            .await
            .unwrap_or_else(|_| Err(ErrorKind::Timeout(budget)))
    }

    async fn resolve(&self, descriptor: RequestDescriptor) -> Result<RawResponse> {
        let inner = &self.inner;
        let key = descriptor.dedupe_key();
        let bucket = inner.resolver.resolve(&descriptor);

        if descriptor.is_cacheable() {
            if let Some(response) = inner.cache.get(&key) {
                log::trace!("Cache hit for {key}");
                inner.stats.update(&bucket, |s| s.cache_hits += 1);
                return Ok(response);
            }
            inner.stats.update(&bucket, |s| s.cache_misses += 1);
        }

        if let Some(error) = inner.rejected.check(&descriptor) {
            return Err(error);
        }

        let (id, flight) = inner.inflight.begin(&key);
        let _guard = WaiterGuard {
            inner: Arc::clone(inner),
            key: key.clone(),
            bucket: bucket.clone(),
            id,
        };

        let waiter = match flight {
            Flight::Joiner(waiter) => {
                log::trace!("Joining in-flight request {key}");
                inner.stats.update(&bucket, |s| s.coalesced += 1);
                waiter
            }
            Flight::Leader(sink, waiter) => {
                // An identical request may have completed since the lookup above
                if descriptor.is_cacheable()
                    && let Some(response) = inner.cache.get(&key)
                {
                    sink.complete(Ok(response.clone()));
                    return Ok(response);
                }

                let item = QueueItem::new(id, descriptor, bucket.clone(), sink);
                if inner.queue.enqueue(item) {
                    tokio::spawn(drain(Arc::clone(inner), bucket));
                }
                waiter
            }
        };

        waiter.outcome().await
    }

    /// Rate limit state of a bucket as last reported by the server
    #[must_use]
    pub fn bucket(&self, key: &BucketKey) -> Option<Bucket> {
        self.inner.tracker.bucket(key)
    }

    /// Statistics of one bucket
    #[must_use]
    pub fn bucket_stats(&self, key: &BucketKey) -> BucketStats {
        self.inner.stats.get(key)
    }

    /// Statistics of all buckets seen so far
    #[must_use]
    pub fn all_bucket_stats(&self) -> HashMap<BucketKey, BucketStats> {
        self.inner.stats.all()
    }

    /// Number of requests waiting for dispatch on a bucket
    #[must_use]
    pub fn queued(&self, key: &BucketKey) -> usize {
        self.inner.queue.len(key)
    }

    /// Bucket a request would be counted against
    #[must_use]
    pub fn bucket_for(&self, descriptor: &RequestDescriptor) -> BucketKey {
        self.inner.resolver.resolve(descriptor)
    }

    /// Drop the cached response of a request, if any
    pub fn invalidate(&self, descriptor: &RequestDescriptor) {
        self.inner.cache.invalidate(&descriptor.dedupe_key());
    }
}

/// Unregisters a caller from an in-flight request when it stops waiting
struct WaiterGuard {
    inner: Arc<Inner>,
    key: DedupeKey,
    bucket: BucketKey,
    id: ItemId,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let inner = &self.inner;
        let withdrawn = inner
            .inflight
            .leave(&self.key, self.id, || inner.queue.cancel(&self.bucket, self.id));
        if withdrawn.is_some() {
            log::debug!("Withdrew {} from bucket {}", self.key, self.bucket);
        }
    }
}

/// Run the drain loop of a bucket until its queue is empty.
///
/// A panic while dispatching fails the request at hand with
/// [`ErrorKind::Cancelled`]; the rest of the queue keeps going.
async fn drain(inner: Arc<Inner>, bucket: BucketKey) {
    log::debug!("Draining bucket {bucket}");
    while AssertUnwindSafe(drain_queue(&inner, &bucket))
        .catch_unwind()
        .await
        .is_err()
    {
        log::error!("Drain loop of bucket {bucket} panicked");
        if !inner.queue.release(&bucket) {
            return;
        }
    }
    log::debug!("Bucket {bucket} is drained");
}

/// Dispatch the queue of one bucket in order until it is empty
async fn drain_queue(inner: &Inner, bucket: &BucketKey) {
    loop {
        match inner.queue.front(bucket) {
            Front::Drained => return,
            Front::NotBefore(instant) => {
                sleep_until(instant).await;
                continue;
            }
            Front::Ready => {}
        }

        if let Reservation::Wait(until) = inner.tracker.reserve(bucket) {
            log::debug!(
                "Bucket {bucket} is exhausted, waiting {}ms",
                until.saturating_duration_since(Instant::now()).as_millis()
            );
            sleep_until(until).await;
            continue;
        }

        let Some(item) = inner.queue.dequeue_next(bucket) else {
            continue;
        };
        if let Dispatched::Retry(item) = inner.dispatcher.dispatch(item).await {
            inner.queue.requeue_front(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use futures::future::join_all;
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;
    use test_utils::{mock_api_error, mock_server};
    use tokio::time::{Instant, advance, sleep};

    use super::*;
    use crate::test_utils::{ScriptedTransport, reply, server_key};
    use crate::transport::TransportError;
    use crate::{ApiErrorCode, ServerBuckets};

    fn governor(transport: &Arc<ScriptedTransport>, config: GovernorConfig) -> Governor {
        GovernorBuilder::builder()
            .transport(transport.clone())
            .config(config)
            .build()
            .governor()
            .unwrap()
    }

    fn shared_bucket_governor(transport: &Arc<ScriptedTransport>) -> Governor {
        GovernorBuilder::builder()
            .transport(transport.clone())
            .resolver(Arc::new(ServerBuckets))
            .config(fast_backoff())
            .build()
            .governor()
            .unwrap()
    }

    fn fast_backoff() -> GovernorConfig {
        GovernorConfig {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            ..GovernorConfig::default()
        }
    }

    fn get(route: &str) -> RequestDescriptor {
        RequestDescriptor::get(server_key('p'), route).unwrap()
    }

    fn players() -> RequestDescriptor {
        get("/server/players").cacheable("players")
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_submissions_share_one_call() {
        let transport = ScriptedTransport::with_latency(Duration::from_millis(100), |r, _| {
            Ok(reply(200, &[], r.route()))
        });
        let governor = governor(&transport, GovernorConfig::default());

        let results = join_all((0..5).map(|_| governor.submit(players()))).await;
        assert_eq!(transport.count(), 1);

        let first = results[0].as_ref().unwrap();
        assert_eq!(first.text(), "/server/players");
        for result in &results {
            assert!(result.as_ref().unwrap().shares_body_with(first));
        }

        let cached = governor.submit(players()).await.unwrap();
        assert!(cached.shares_body_with(first));
        assert_eq!(transport.count(), 1);

        let stats = governor.bucket_stats(&governor.bucket_for(&players()));
        assert_eq!(stats.upstream_requests, 1);
        assert_eq!(stats.coalesced, 4);
        assert_eq!(stats.cache_misses, 5);
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_failures_are_shared() {
        let transport = ScriptedTransport::with_latency(Duration::from_millis(10), |_, _| {
            Ok(reply(500, &[], ""))
        });
        let governor = governor(&transport, fast_backoff());

        let results = join_all((0..3).map(|_| governor.submit(get("/server/bans")))).await;
        assert_eq!(transport.count(), 4);
        for result in results {
            let Err(ErrorKind::ServerError { attempts, .. }) = result else {
                panic!("expected a server error, got {result:?}");
            };
            assert_eq!(attempts, 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_waits_for_reset() {
        let transport = ScriptedTransport::new(|r, _| {
            Ok(reply(
                200,
                &[
                    ("x-ratelimit-limit", "1"),
                    ("x-ratelimit-remaining", "0"),
                    ("x-ratelimit-reset-after", "2"),
                ],
                r.route(),
            ))
        });
        let governor = shared_bucket_governor(&transport);
        let start = Instant::now();

        governor.submit(get("/server/players")).await.unwrap();
        let bucket = governor.bucket_for(&get("/server/queue"));
        assert_eq!(governor.bucket(&bucket).unwrap().remaining, Some(0));

        governor.submit(get("/server/queue")).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].at - start < Duration::from_secs(2));
        assert!(calls[1].at - start >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honoured() {
        let transport = ScriptedTransport::new(|r, seen| {
            Ok(if seen == 0 {
                reply(429, &[("retry-after", "3")], "")
            } else {
                reply(200, &[], r.route())
            })
        });
        let governor = governor(&transport, GovernorConfig::default());
        let start = Instant::now();

        let response = governor.submit(get("/server/players")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.count(), 2);
        assert!(transport.calls()[1].at - start >= Duration::from_secs(3));
        assert!(start.elapsed() >= Duration::from_secs(3));

        let stats = governor.bucket_stats(&governor.bucket_for(&get("/server/players")));
        assert_eq!(stats.rate_limited, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_from_body() {
        let transport = ScriptedTransport::new(|r, seen| {
            Ok(if seen == 0 {
                reply(429, &[], r#"{"code": 4001, "retry_after": 1.5}"#)
            } else {
                reply(200, &[], r.route())
            })
        });
        let governor = governor(&transport, GovernorConfig::default());
        let start = Instant::now();

        governor.submit(get("/server/players")).await.unwrap();
        assert!(transport.calls()[1].at - start >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exceeded() {
        let transport =
            ScriptedTransport::new(|_, _| Ok(reply(429, &[("retry-after", "1")], "")));
        let governor = governor(&transport, GovernorConfig::default());

        let error = governor.submit(get("/server/players")).await.unwrap_err();
        let ErrorKind::RateLimitExceeded {
            attempts,
            retry_after,
            ..
        } = error
        else {
            panic!("expected rate limit error, got {error:?}");
        };
        assert_eq!(attempts, 4);
        assert_eq!(retry_after, Some(Duration::from_secs(1)));
        assert_eq!(transport.count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_are_not_cached() {
        let transport = ScriptedTransport::new(|_, _| Ok(reply(500, &[], "")));
        let governor = governor(&transport, fast_backoff());

        let error = governor.submit(players()).await.unwrap_err();
        assert_eq!(error.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(matches!(error, ErrorKind::ServerError { attempts: 4, .. }));
        assert_eq!(transport.count(), 4);

        // A new submission starts over instead of seeing the old failure
        governor.submit(players()).await.unwrap_err();
        assert_eq!(transport.count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_recovers() {
        let transport = ScriptedTransport::new(|r, seen| {
            Ok(if seen < 2 {
                reply(503, &[], "")
            } else {
                reply(200, &[], r.route())
            })
        });
        let governor = governor(&transport, fast_backoff());
        let start = Instant::now();

        governor.submit(get("/server/vehicles")).await.unwrap();
        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        // Backoff of the first retry is at least half of its base delay
        assert!(calls[1].at - start >= Duration::from_millis(50));
        assert!(calls[2].at - calls[1].at >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors() {
        let transport = ScriptedTransport::new(|r, _| {
            if r.route() == "/server/players" {
                Err(TransportError::Io(io::ErrorKind::ConnectionReset.into()))
            } else {
                Err(TransportError::InvalidUrl(r.route().to_string()))
            }
        });
        let governor = governor(&transport, fast_backoff());

        let error = governor.submit(get("/server/players")).await.unwrap_err();
        assert!(matches!(error, ErrorKind::NetworkError { attempts: 4, .. }));

        let error = governor.submit(get("/server/queue")).await.unwrap_err();
        assert!(matches!(error, ErrorKind::NetworkError { attempts: 1, .. }));
        assert_eq!(transport.count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_fail_immediately() {
        let transport = ScriptedTransport::new(|_, _| {
            Ok(reply(422, &[], r#"{"code": 3001, "message": "Invalid command"}"#))
        });
        let governor = governor(&transport, GovernorConfig::default());

        let error = governor.submit(get("/server/command")).await.unwrap_err();
        assert_eq!(error.status(), Some(StatusCode::UNPROCESSABLE_ENTITY));
        assert_eq!(
            error.api_error().map(|e| e.code),
            Some(ApiErrorCode::InvalidCommand)
        );
        assert_eq!(transport.count(), 1);

        // Not a rejected key, so the next request goes out again
        governor.submit(get("/server/command")).await.unwrap_err();
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_status_is_not_retried() {
        let transport = ScriptedTransport::new(|_, _| Ok(reply(408, &[], "")));
        let governor = governor(&transport, fast_backoff());

        let error = governor.submit(get("/server")).await.unwrap_err();
        assert!(matches!(
            error,
            ErrorKind::ClientError { status: StatusCode::REQUEST_TIMEOUT, .. }
        ));
        assert_eq!(transport.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_key_is_remembered() {
        let transport = ScriptedTransport::new(|_, _| {
            Ok(reply(403, &[], r#"{"code": 2002, "message": "Invalid server key"}"#))
        });
        let governor = governor(&transport, GovernorConfig::default());

        let first = governor.submit(get("/server")).await.unwrap_err();
        let second = governor.submit(get("/server/players")).await.unwrap_err();

        assert_eq!(transport.count(), 1);
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(
            second.api_error().map(|e| e.code),
            Some(ApiErrorCode::InvalidServerKey)
        );

        // Other server keys are not affected
        let other = RequestDescriptor::get(server_key('q'), "/server").unwrap();
        governor.submit(other).await.unwrap_err();
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_per_bucket() {
        let transport = ScriptedTransport::new(|r, seen| {
            Ok(if r.route() == "/a" && seen == 0 {
                reply(429, &[("retry-after", "1")], "")
            } else {
                reply(200, &[], r.route())
            })
        });
        let governor = shared_bucket_governor(&transport);

        let results = join_all(["/a", "/b", "/c"].map(|route| governor.submit(get(route)))).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(transport.routes(), vec!["/a", "/a", "/b", "/c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_progress_independently() {
        let transport = ScriptedTransport::new(|r, seen| {
            Ok(if r.route() == "/server/players" && seen == 0 {
                reply(429, &[("retry-after", "5")], "")
            } else {
                reply(200, &[], r.route())
            })
        });
        let governor = governor(&transport, GovernorConfig::default());
        let start = Instant::now();

        let (players, queue) = tokio::join!(
            governor.submit(get("/server/players")),
            governor.submit(get("/server/queue"))
        );
        players.unwrap();
        queue.unwrap();

        let queue_call = transport
            .calls()
            .into_iter()
            .find(|call| call.route == "/server/queue")
            .unwrap();
        assert!(queue_call.at - start < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit_blocks_all_buckets_of_server() {
        let transport = ScriptedTransport::new(|r, seen| {
            Ok(if r.route() == "/server/players" && seen == 0 {
                reply(
                    429,
                    &[("retry-after", "5"), ("x-ratelimit-bucket", "global")],
                    "",
                )
            } else {
                reply(200, &[], r.route())
            })
        });
        let governor = governor(&transport, GovernorConfig::default());
        let start = Instant::now();

        let later = async {
            sleep(Duration::from_secs(1)).await;
            governor.submit(get("/server/queue")).await
        };
        let (players, queue) = tokio::join!(governor.submit(get("/server/players")), later);
        players.unwrap();
        queue.unwrap();

        let queue_call = transport
            .calls()
            .into_iter()
            .find(|call| call.route == "/server/queue")
            .unwrap();
        assert!(queue_call.at - start >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiry_refetches_once() {
        let transport = ScriptedTransport::ok();
        let governor = governor(&transport, GovernorConfig::default());

        governor.submit(players()).await.unwrap();
        advance(Duration::from_secs(4)).await;
        governor.submit(players()).await.unwrap();
        assert_eq!(transport.count(), 1);

        advance(Duration::from_secs(1)).await;
        governor.submit(players()).await.unwrap();
        governor.submit(players()).await.unwrap();
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_and_uncacheable_requests() {
        let transport = ScriptedTransport::ok();
        let config = GovernorConfig::default().with_ttl("players", Duration::ZERO);
        let governor = governor(&transport, config);

        governor.submit(players()).await.unwrap();
        governor.submit(players()).await.unwrap();
        governor.submit(get("/server/bans")).await.unwrap();
        governor.submit(get("/server/bans")).await.unwrap();
        assert_eq!(transport.count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl() {
        let transport = ScriptedTransport::ok();
        let config = GovernorConfig::default().with_ttl("catalog", Duration::MAX);
        let governor = GovernorBuilder::builder()
            .transport(transport.clone())
            .resolver(Arc::new(ServerBuckets))
            .config(config)
            .build()
            .governor()
            .unwrap();
        let catalog = || get("/server/vehicles").cacheable("catalog");

        assert_eq!(governor.submit(catalog()).await.unwrap().text(), "/server/vehicles");
        advance(Duration::from_secs(86400)).await;
        governor.submit(catalog()).await.unwrap();
        assert_eq!(transport.count(), 1);

        governor.submit(get("/server/queue")).await.unwrap();
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate() {
        let transport = ScriptedTransport::ok();
        let governor = governor(&transport, GovernorConfig::default());

        governor.submit(players()).await.unwrap();
        governor.invalidate(&players());
        governor.submit(players()).await.unwrap();
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_only_affects_its_caller() {
        let transport = ScriptedTransport::with_latency(Duration::from_secs(10), |r, _| {
            Ok(reply(200, &[], r.route()))
        });
        let governor = governor(&transport, GovernorConfig::default());

        let (impatient, patient) = tokio::join!(
            governor.submit_until(players(), Instant::now() + Duration::from_secs(1)),
            governor.submit(players())
        );

        assert!(matches!(impatient, Err(ErrorKind::Timeout(d)) if d == Duration::from_secs(1)));
        assert_eq!(patient.unwrap().text(), "/server/players");
        assert_eq!(transport.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_request_timeout() {
        let transport = ScriptedTransport::with_latency(Duration::from_secs(60), |r, _| {
            Ok(reply(200, &[], r.route()))
        });
        let config = GovernorConfig {
            request_timeout: Duration::from_secs(5),
            ..GovernorConfig::default()
        };
        let governor = governor(&transport, config);

        let error = governor.submit(get("/server")).await.unwrap_err();
        assert!(matches!(error, ErrorKind::Timeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_request_timeout() {
        let transport = ScriptedTransport::with_latency(Duration::from_secs(600), |r, _| {
            Ok(reply(200, &[], r.route()))
        });
        let config = GovernorConfig {
            request_timeout: Duration::MAX,
            ..GovernorConfig::default()
        };
        let governor = governor(&transport, config);

        let response = governor.submit(get("/server")).await.unwrap();
        assert_eq!(response.text(), "/server");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_dispatch_does_not_stall_bucket() {
        let transport = ScriptedTransport::new(|r, _| {
            assert_ne!(r.route(), "/boom", "transport failure");
            Ok(reply(200, &[], r.route()))
        });
        let governor = shared_bucket_governor(&transport);

        let (boom, queued) = tokio::join!(
            governor.submit(get("/boom")),
            governor.submit(get("/server"))
        );
        assert!(matches!(boom, Err(ErrorKind::Cancelled)));
        assert_eq!(queued.unwrap().text(), "/server");

        let later = governor.submit(get("/server/queue")).await.unwrap();
        assert_eq!(later.text(), "/server/queue");
        assert_eq!(transport.routes(), vec!["/boom", "/server", "/server/queue"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_interval_spaces_dispatches() {
        let transport = ScriptedTransport::ok();
        let config = GovernorConfig {
            request_interval: Some(Duration::from_secs(1)),
            ..GovernorConfig::default()
        };
        let governor = GovernorBuilder::builder()
            .transport(transport.clone())
            .resolver(Arc::new(ServerBuckets))
            .config(config)
            .build()
            .governor()
            .unwrap();

        let results = join_all(["/a", "/b", "/c"].map(|route| governor.submit(get(route)))).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].at - calls[0].at >= Duration::from_millis(999));
        assert!(calls[2].at - calls[1].at >= Duration::from_millis(999));
    }

    fn exhausting(r: &RequestDescriptor, _: usize) -> std::result::Result<RawResponse, TransportError> {
        Ok(reply(
            200,
            &[
                ("x-ratelimit-limit", "1"),
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset-after", "10"),
            ],
            r.route(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_dispatch() {
        let transport = ScriptedTransport::new(exhausting);
        let governor = shared_bucket_governor(&transport);
        governor.submit(get("/server/players")).await.unwrap();

        let bucket = governor.bucket_for(&get("/server/queue"));
        let error = governor
            .submit_until(get("/server/queue"), Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(error, ErrorKind::Timeout(_)));
        assert_eq!(governor.queued(&bucket), 0);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_keeps_request_for_joiners() {
        let transport = ScriptedTransport::new(exhausting);
        let governor = shared_bucket_governor(&transport);
        governor.submit(get("/server/players")).await.unwrap();

        let leader = tokio::spawn({
            let governor = governor.clone();
            async move { governor.submit(get("/server/queue")).await }
        });
        sleep(Duration::from_millis(100)).await;
        let joiner = tokio::spawn({
            let governor = governor.clone();
            async move { governor.submit(get("/server/queue")).await }
        });
        sleep(Duration::from_millis(100)).await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        let response = joiner.await.unwrap().unwrap();
        assert_eq!(response.text(), "/server/queue");
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_base_url() {
        let result = GovernorBuilder::builder()
            .base_url("not a url")
            .build()
            .governor();
        assert!(matches!(result, Err(ErrorKind::InvalidBaseUrl(_))));
    }

    #[tokio::test]
    async fn test_over_http() {
        let mock_server = mock_server!(
            StatusCode::OK,
            set_body_string(r#"[{"Player":"Someone:1","Permission":"Normal"}]"#)
        );
        let governor = GovernorBuilder::builder()
            .base_url(mock_server.uri())
            .global_key(SecretString::from("global"))
            .timeout(Duration::from_secs(5))
            .build()
            .governor()
            .unwrap();

        let response = governor.submit(players()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.text().contains("Someone:1"));
    }

    #[tokio::test]
    async fn test_banned_key_over_http() {
        let mock_server = mock_api_error!(StatusCode::FORBIDDEN, 2004, "Banned");
        let governor = GovernorBuilder::builder()
            .base_url(mock_server.uri())
            .build()
            .governor()
            .unwrap();

        let error = governor.submit(get("/server")).await.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Request rejected with status 403 Forbidden: server key is banned (code 2004): Banned"
        );
        governor.submit(get("/server/players")).await.unwrap_err();
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_global_key_over_http() {
        let mock_server = mock_api_error!(StatusCode::FORBIDDEN, 2003, "Invalid global key");
        let governor = GovernorBuilder::builder()
            .base_url(mock_server.uri())
            .global_key(SecretString::from("stale"))
            .build()
            .governor()
            .unwrap();

        let first = governor.submit(get("/server")).await.unwrap_err();
        assert_eq!(
            first.api_error().map(|e| e.code),
            Some(ApiErrorCode::InvalidGlobalKey)
        );

        let second = governor.submit(get("/server/players")).await.unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);

        // Requests without the global key still go out
        let keyless = get("/server/players").without_global_key();
        governor.submit(keyless).await.unwrap_err();
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    }
}
