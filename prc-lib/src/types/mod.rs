mod api_error;
mod error;
mod request;
mod response;
mod server_key;

pub use api_error::{ApiError, ApiErrorCode};
pub use error::{ErrorKind, Result};
pub use request::{CacheCategory, DedupeKey, RequestDescriptor};
pub use response::RawResponse;
pub use server_key::ServerKey;
