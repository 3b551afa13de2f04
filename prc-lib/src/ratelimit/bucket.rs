use std::fmt;

use http::Method;

use crate::RequestDescriptor;

/// Identifies one rate limit bucket: a server plus a route class.
///
/// Which requests share a class is decided by a [`BucketKeyResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    server: String,
    class: String,
}

impl BucketKey {
    /// Create a bucket key for the given server id and route class
    #[must_use]
    pub fn new(server: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            class: class.into().to_lowercase(),
        }
    }

    /// The server id this bucket belongs to
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The route class within the server
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.class)
    }
}

/// Maps a request to the bucket it is counted against.
///
/// The bucket granularity of the remote API is a contract detail, so it is
/// pluggable. Closures of type `Fn(&RequestDescriptor) -> BucketKey` work
/// as resolvers too.
pub trait BucketKeyResolver: Send + Sync {
    /// Resolve the bucket for `descriptor`
    fn resolve(&self, descriptor: &RequestDescriptor) -> BucketKey;
}

impl<F> BucketKeyResolver for F
where
    F: Fn(&RequestDescriptor) -> BucketKey + Send + Sync,
{
    fn resolve(&self, descriptor: &RequestDescriptor) -> BucketKey {
        self(descriptor)
    }
}

/// One bucket per server, method and route. This is the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteBuckets;

impl BucketKeyResolver for RouteBuckets {
    fn resolve(&self, descriptor: &RequestDescriptor) -> BucketKey {
        BucketKey::new(
            descriptor.server_key().id(),
            format!("{} {}", descriptor.method(), descriptor.route()),
        )
    }
}

/// A single bucket per server
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerBuckets;

impl BucketKeyResolver for ServerBuckets {
    fn resolve(&self, descriptor: &RequestDescriptor) -> BucketKey {
        BucketKey::new(descriptor.server_key().id(), "global")
    }
}

/// Route used by the PRC API to run in-game commands
pub const COMMAND_ROUTE: &str = "/server/command";

/// Two buckets per server: one for command execution and one for
/// everything else, mirroring how the PRC API groups its limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBuckets;

impl BucketKeyResolver for CommandBuckets {
    fn resolve(&self, descriptor: &RequestDescriptor) -> BucketKey {
        let class = if descriptor.method() == Method::POST && descriptor.route() == COMMAND_ROUTE {
            "command"
        } else {
            "global"
        };
        BucketKey::new(descriptor.server_key().id(), class)
    }
}
