//! Handle rate limiting headers.
//!
//! The PRC API reports its quota with the common `X-RateLimit-*` fields
//! and answers 429 responses with a `Retry-After` header or a
//! `retry_after` field in the JSON body.

use http::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Reset values at or above this are Unix timestamps, below it delays.
const EPOCH_THRESHOLD_SECS: f64 = 1_000_000_000.0;

/// Upper bound for any server-provided delay
const MAX_SERVER_DELAY: Duration = Duration::from_secs(3600);

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RetryAfterParseError {
    #[error("Unable to parse value '{0}'")]
    ValueError(String),

    #[error("Header value contains invalid chars")]
    HeaderValueError,
}

/// Quota information reported by one response
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Quota {
    pub(crate) remaining: Option<usize>,
    pub(crate) limit: Option<usize>,
    /// Time until the bucket resets, relative to when the headers were parsed
    pub(crate) reset_after: Option<Duration>,
    /// Bucket name reported by the server
    pub(crate) bucket: Option<String>,
}

impl Quota {
    /// Whether the server reported this limit as shared by the whole server key
    pub(crate) fn is_global(&self) -> bool {
        self.bucket
            .as_deref()
            .is_some_and(|b| b.eq_ignore_ascii_case("global"))
    }
}

/// Parse the "Retry-After" header as specified per
/// [RFC 7231 section 7.1.3](https://www.rfc-editor.org/rfc/rfc7231#section-7.1.3).
/// Fractional seconds are accepted as well.
pub(crate) fn parse_retry_after(value: &HeaderValue) -> Result<Duration, RetryAfterParseError> {
    let value = value
        .to_str()
        .map_err(|_| RetryAfterParseError::HeaderValueError)?
        .trim();

    // RFC 7231: Retry-After = HTTP-date / delay-seconds
    if let Some(delay) = parse_seconds(value) {
        return Ok(delay);
    }
    httpdate::parse_http_date(value)
        .map(|s| {
            s.duration_since(SystemTime::now())
                // if date is in the past, we can use ZERO
                .unwrap_or(Duration::ZERO)
        })
        .map_err(|_| RetryAfterParseError::ValueError(value.into()))
}

/// Find the retry delay of a 429 response, preferring the header over the body
pub(crate) fn retry_after(headers: &HeaderMap, body: &[u8]) -> Option<Duration> {
    #[derive(Deserialize)]
    struct RateLimitBody {
        retry_after: Option<f64>,
    }

    let from_header = headers
        .get(http::header::RETRY_AFTER)
        .and_then(|value| parse_retry_after(value).ok());

    from_header
        .or_else(|| {
            serde_json::from_slice::<RateLimitBody>(body)
                .ok()
                .and_then(|b| b.retry_after)
                .and_then(seconds_to_duration)
        })
        .map(|delay| delay.min(MAX_SERVER_DELAY))
}

/// Parse the common "X-RateLimit" header fields.
/// Unfortunately, this is not standardised yet, but there is an
/// [IETF draft](https://datatracker.ietf.org/doc/draft-ietf-httpapi-ratelimit-headers/).
pub(crate) fn parse_quota(headers: &HeaderMap) -> Quota {
    let remaining = parse_header_value(
        headers,
        &[
            "x-ratelimit-remaining",
            "x-rate-limit-remaining",
            "ratelimit-remaining",
        ],
    )
    .and_then(|v| v.parse::<usize>().ok());

    let limit = parse_header_value(
        headers,
        &["x-ratelimit-limit", "x-rate-limit-limit", "ratelimit-limit"],
    )
    .and_then(|v| v.parse::<usize>().ok());

    let reset_after = parse_header_value(headers, &["x-ratelimit-reset-after"])
        .and_then(parse_seconds)
        .or_else(|| {
            parse_header_value(
                headers,
                &["x-ratelimit-reset", "x-rate-limit-reset", "ratelimit-reset"],
            )
            .and_then(parse_reset)
        })
        .map(|delay| delay.min(MAX_SERVER_DELAY));

    let bucket = parse_header_value(headers, &["x-ratelimit-bucket"]).map(ToString::to_string);

    Quota {
        remaining,
        limit,
        reset_after,
        bucket,
    }
}

/// A reset value is either a Unix timestamp or a delay in seconds
fn parse_reset(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if secs >= EPOCH_THRESHOLD_SECS {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        seconds_to_duration((secs - now).max(0.0))
    } else {
        seconds_to_duration(secs)
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value.trim().parse::<f64>().ok().and_then(seconds_to_duration)
}

fn seconds_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Return the first header of `header_names` that holds a valid string
fn parse_header_value<'a>(headers: &'a HeaderMap, header_names: &[&str]) -> Option<&'a str> {
    header_names
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
}
