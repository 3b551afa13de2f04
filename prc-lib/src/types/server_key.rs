use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

use crate::{ErrorKind, Result};

/// Server keys look like `<10+ letters>-<40+ letters>`.
static SERVER_KEY_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[a-z]{10,}-[a-z]{40,}$").expect("server key pattern is valid")
});

/// A validated key for a single PRC private server.
///
/// The key itself is a secret and never appears in `Debug` or `Display`
/// output. Only the public server id (the part after the dash) and a
/// digest of the full key are exposed, which is enough to tell keys apart
/// for rate limiting and request de-duplication.
///
/// # Examples
///
/// ```
/// use prc_lib::ServerKey;
///
/// let key: ServerKey = format!("{}-{}", "a".repeat(10), "b".repeat(40)).parse().unwrap();
/// assert_eq!(key.id(), "b".repeat(40));
/// ```
#[derive(Clone)]
pub struct ServerKey {
    id: String,
    digest: u64,
    secret: Arc<SecretString>,
}

impl ServerKey {
    /// Validate and wrap a raw server key.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidServerKey`] if the key does not match
    /// the server key format.
    pub fn new(key: &str) -> Result<Self> {
        let key = key.trim();
        if !SERVER_KEY_FORMAT.is_match(key) {
            return Err(ErrorKind::InvalidServerKey);
        }
        let id = key
            .split_once('-')
            .map(|(_, id)| id.to_string())
            .ok_or(ErrorKind::InvalidServerKey)?;

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);

        Ok(Self {
            id,
            digest: hasher.finish(),
            secret: Arc::new(SecretString::from(key.to_string())),
        })
    }

    /// The public server id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A stable digest of the full key, safe to log and to hash
    #[must_use]
    pub const fn digest(&self) -> u64 {
        self.digest
    }

    /// Access the raw key, e.g. to put it on the wire
    #[must_use]
    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl FromStr for ServerKey {
    type Err = ErrorKind;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<&str> for ServerKey {
    type Error = ErrorKind;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for ServerKey {
    type Error = ErrorKind;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl PartialEq for ServerKey {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.expose() == other.expose()
    }
}

impl Eq for ServerKey {}

impl Hash for ServerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKey")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server {}", self.id)
    }
}
