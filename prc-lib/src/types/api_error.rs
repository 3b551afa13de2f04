use std::fmt::Display;

use serde::Deserialize;
use strum::{Display as StrumDisplay, EnumIter, IntoEnumIterator};

/// Error codes returned in the JSON body of failed PRC API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumIter)]
#[non_exhaustive]
pub enum ApiErrorCode {
    /// Unknown error, or a code this crate does not know about
    #[strum(serialize = "unknown error")]
    Unknown,
    /// The API could not reach the game server
    #[strum(serialize = "error while communicating with the game server")]
    CommunicationError,
    /// Internal error on the API side
    #[strum(serialize = "internal API error")]
    InternalError,
    #[strum(serialize = "no server key was provided")]
    MissingServerKey,
    #[strum(serialize = "server key has an invalid format")]
    InvalidServerKeyFormat,
    #[strum(serialize = "server key is invalid or expired")]
    InvalidServerKey,
    #[strum(serialize = "global API key is invalid")]
    InvalidGlobalKey,
    #[strum(serialize = "server key is banned")]
    BannedServerKey,
    #[strum(serialize = "command is invalid")]
    InvalidCommand,
    /// The server has no players in it
    #[strum(serialize = "server is offline")]
    ServerOffline,
    #[strum(serialize = "rate limited")]
    RateLimit,
    #[strum(serialize = "command is restricted")]
    RestrictedCommand,
    #[strum(serialize = "message is prohibited")]
    ProhibitedMessage,
    #[strum(serialize = "resource is restricted")]
    RestrictedResource,
    /// The in-game module of the server is out of date
    #[strum(serialize = "server module is out of date")]
    OutOfDateModule,
}

impl ApiErrorCode {
    /// The numeric code used on the wire
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::CommunicationError => 1001,
            Self::InternalError => 1002,
            Self::MissingServerKey => 2000,
            Self::InvalidServerKeyFormat => 2001,
            Self::InvalidServerKey => 2002,
            Self::InvalidGlobalKey => 2003,
            Self::BannedServerKey => 2004,
            Self::InvalidCommand => 3001,
            Self::ServerOffline => 3002,
            Self::RateLimit => 4001,
            Self::RestrictedCommand => 4002,
            Self::ProhibitedMessage => 4003,
            Self::RestrictedResource => 9998,
            Self::OutOfDateModule => 9999,
        }
    }

    /// Whether this code means the server key itself will never work again
    #[must_use]
    pub const fn rejects_server_key(self) -> bool {
        matches!(self, Self::InvalidServerKey | Self::BannedServerKey)
    }

    /// Whether this code means the global API key will never work again
    #[must_use]
    pub const fn rejects_global_key(self) -> bool {
        matches!(self, Self::InvalidGlobalKey)
    }
}

impl From<u32> for ApiErrorCode {
    fn from(code: u32) -> Self {
        Self::iter()
            .find(|known| known.as_u32() == code)
            .unwrap_or(Self::Unknown)
    }
}

/// A decoded error body of the PRC API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// The classified error code
    pub code: ApiErrorCode,
    /// The numeric code as sent by the server
    pub raw_code: u32,
    /// Optional human readable message from the server
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<u32>,
    message: Option<String>,
}

impl ApiError {
    /// Decode an error body, returning `None` if it does not carry a code.
    #[must_use]
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let ErrorBody { code, message } = serde_json::from_slice(body).ok()?;
        let raw_code = code?;
        Some(Self {
            code: ApiErrorCode::from(raw_code),
            raw_code,
            message,
        })
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.code, self.raw_code)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}
