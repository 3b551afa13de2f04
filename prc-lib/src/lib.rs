//! `prc_lib` is a client core for the PRC private server API.
//!
//! Requests are described by a [`RequestDescriptor`] and submitted to a
//! [`Governor`], which makes sure that
//!
//! - the rate limits reported by the API are respected, per bucket,
//! - identical requests in flight at the same time hit the network once,
//! - successful responses are cached for a configurable time.
//!
//! ```no_run
//! use prc_lib::{GovernorBuilder, RequestDescriptor, Result, ServerKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let governor = GovernorBuilder::default().governor()?;
//!   let key: ServerKey = std::env::var("PRC_SERVER_KEY").unwrap_or_default().parse()?;
//!
//!   let players = RequestDescriptor::get(key, "/server/players")?.cacheable("players");
//!   let response = governor.submit(players).await?;
//!   println!("{}", response.text());
//!   Ok(())
//! }
//! ```
//!
//! Use [`GovernorBuilder`] to configure retries, cache lifetimes, the bucket
//! layout or a custom [`Transport`].

mod cache;
mod config;
mod dispatch;
mod governor;
mod queue;
mod ratelimit;
mod retry;
mod stats;
mod time;
mod types;

pub mod transport;

#[cfg(test)]
mod test_utils;

pub use crate::{
    cache::CacheStore,
    config::GovernorConfig,
    governor::{DEFAULT_USER_AGENT, Governor, GovernorBuilder},
    ratelimit::{
        Bucket, BucketKey, BucketKeyResolver, COMMAND_ROUTE, CommandBuckets, RateLimitTracker,
        Reservation, RouteBuckets, ServerBuckets,
    },
    stats::BucketStats,
    transport::{ReqwestTransport, Transport, TransportError},
    types::*,
};
