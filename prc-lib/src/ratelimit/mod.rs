//! Rate limiting for the PRC API.
//!
//! Requests are grouped into buckets by a [`BucketKeyResolver`].
//! The [`RateLimitTracker`] remembers what the server reported about each
//! bucket and decides when the next request of a bucket may be sent.
//! Dispatch itself happens in [`crate::Governor`], one FIFO queue per bucket.

mod bucket;
mod headers;
mod tracker;

pub use bucket::{
    BucketKey, BucketKeyResolver, COMMAND_ROUTE, CommandBuckets, RouteBuckets, ServerBuckets,
};
pub(crate) use headers::{parse_quota, retry_after};
pub use tracker::{Bucket, RateLimitTracker, Reservation};
