//! Response caching and single-flight de-duplication.

mod inflight;
mod store;

pub(crate) use inflight::{Flight, InFlight, ItemId, ResultSink};
pub use store::CacheStore;
