use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use http::StatusCode;
use tokio::time::Instant;

use crate::cache::CacheStore;
use crate::queue::QueueItem;
use crate::ratelimit::{parse_quota, retry_after};
use crate::retry::{Backoff, RetryExt};
use crate::stats::StatsRecorder;
use crate::time;
use crate::transport::{Transport, TransportError};
use crate::{
    ApiError, ApiErrorCode, ErrorKind, GovernorConfig, RateLimitTracker, RawResponse,
    RequestDescriptor,
};

/// Outcome of one dispatch attempt
#[derive(Debug)]
pub(crate) enum Dispatched {
    /// The result was published to all waiters
    Done,
    /// The item must go back to the head of its bucket queue
    Retry(QueueItem),
}

/// Keys the API has rejected, with the error it answered
#[derive(Debug, Default)]
pub(crate) struct RejectedKeys {
    servers: DashMap<u64, ErrorKind>,
    global: OnceLock<ErrorKind>,
}

impl RejectedKeys {
    /// The error a request is known to fail with, if any of its keys
    /// has been rejected before
    pub(crate) fn check(&self, descriptor: &RequestDescriptor) -> Option<ErrorKind> {
        if let Some(error) = self.servers.get(&descriptor.server_key().digest()) {
            return Some(error.clone());
        }
        if descriptor.uses_global_key() {
            return self.global.get().cloned();
        }
        None
    }

    fn insert(&self, descriptor: &RequestDescriptor, code: ApiErrorCode, error: &ErrorKind) {
        if code.rejects_server_key() {
            log::warn!(
                "The API rejected the key of {}, further requests will fail immediately",
                descriptor.server_key()
            );
            self.servers
                .insert(descriptor.server_key().digest(), error.clone());
        } else if code.rejects_global_key() && descriptor.uses_global_key() {
            log::warn!(
                "The API rejected the global key, further requests using it will fail immediately"
            );
            let _ = self.global.set(error.clone());
        }
    }
}

/// Sends queued requests and decides what happens with their responses
pub(crate) struct Dispatcher {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) tracker: Arc<RateLimitTracker>,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) stats: Arc<StatsRecorder>,
    pub(crate) rejected: Arc<RejectedKeys>,
    pub(crate) config: GovernorConfig,
}

impl Dispatcher {
    fn backoff(&self) -> Backoff {
        Backoff::new(self.config.backoff_base, self.config.backoff_max)
    }

    fn retries_left(&self, item: &QueueItem) -> bool {
        item.attempt_count <= self.config.max_retries
    }

    /// Make one attempt for `item`. The caller must hold a reservation
    /// for the item's bucket.
    pub(crate) async fn dispatch(&self, mut item: QueueItem) -> Dispatched {
        item.attempt_count += 1;
        item.not_before = None;
        log::debug!(
            "Dispatching {} on bucket {} (attempt {}, queued for {}ms)",
            item.sink.key(),
            item.bucket,
            item.attempt_count,
            item.enqueued_at.elapsed().as_millis()
        );

        let started = Instant::now();
        let result = self.transport.send(&item.descriptor).await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => {
                self.stats.update(&item.bucket, |s| {
                    s.record_response(response.status().as_u16(), elapsed);
                });
                self.tracker.observe(&item.bucket, response.headers());
                self.handle_response(item, response)
            }
            Err(error) => {
                self.stats
                    .update(&item.bucket, |s| s.record_network_error(elapsed));
                self.handle_transport_error(item, error)
            }
        }
    }

    fn handle_response(&self, item: QueueItem, response: RawResponse) -> Dispatched {
        let status = response.status();

        if status.is_success() {
            if item.descriptor.is_cacheable() {
                let ttl = self.config.ttl_for(item.descriptor.cache_category());
                self.cache.put(item.sink.key().clone(), response.clone(), ttl);
            }
            item.sink.complete(Ok(response));
            return Dispatched::Done;
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return self.handle_rate_limited(item, &response);
        }

        let api_error = ApiError::from_body(response.body());

        if status.should_retry() {
            if self.retries_left(&item) {
                return self.back_off(item, &format!("status {status}"));
            }
            log::warn!(
                "Giving up on {} after {} attempts: status {status}",
                item.sink.key(),
                item.attempt_count
            );
            let error = ErrorKind::ServerError {
                status,
                attempts: item.attempt_count,
                api_error,
            };
            item.sink.complete(Err(error));
            return Dispatched::Done;
        }

        let code = api_error.as_ref().map(|e| e.code);
        let error = ErrorKind::ClientError { status, api_error };
        if let Some(code) = code {
            self.rejected.insert(&item.descriptor, code, &error);
        }
        log::debug!("{} was rejected: {error}", item.sink.key());
        item.sink.complete(Err(error));
        Dispatched::Done
    }

    fn handle_rate_limited(&self, item: QueueItem, response: &RawResponse) -> Dispatched {
        let delay = retry_after(response.headers(), response.body())
            .unwrap_or_else(|| self.backoff().delay(item.attempt_count));
        let global = parse_quota(response.headers()).is_global();
        self.tracker.rate_limited(&item.bucket, delay, global);

        if self.retries_left(&item) {
            log::debug!(
                "Bucket {} is rate limited, retrying {} in {}ms",
                item.bucket,
                item.sink.key(),
                delay.as_millis()
            );
            return Dispatched::Retry(item);
        }

        log::warn!(
            "Giving up on {} after {} rate limited attempts",
            item.sink.key(),
            item.attempt_count
        );
        let error = ErrorKind::RateLimitExceeded {
            bucket: item.bucket.clone(),
            attempts: item.attempt_count,
            retry_after: Some(delay),
        };
        item.sink.complete(Err(error));
        Dispatched::Done
    }

    fn handle_transport_error(&self, item: QueueItem, error: TransportError) -> Dispatched {
        if error.should_retry() && self.retries_left(&item) {
            return self.back_off(item, &error.to_string());
        }

        log::warn!(
            "Giving up on {} after {} attempts: {error}",
            item.sink.key(),
            item.attempt_count
        );
        let error = ErrorKind::NetworkError {
            attempts: item.attempt_count,
            source: Arc::new(error),
        };
        item.sink.complete(Err(error));
        Dispatched::Done
    }

    fn back_off(&self, mut item: QueueItem, reason: &str) -> Dispatched {
        let delay = self.backoff().delay(item.attempt_count);
        log::debug!(
            "Retrying {} in {}ms after {reason}",
            item.sink.key(),
            delay.as_millis()
        );
        item.not_before = Some(time::after(Instant::now(), delay));
        Dispatched::Retry(item)
    }
}
