use std::fmt;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// `typeKey` the cache service reports when a key is already reserved or
/// committed.
pub const ALREADY_EXISTS_TYPE_KEY: &str = "ArtifactCacheItemAlreadyExistsException";

/// Structured error body returned by the cache service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiError {
    pub message: String,
    pub type_name: String,
    pub type_key: String,
    pub error_code: i64,
}

impl ApiError {
    /// Decodes a response body as a service error. Empty bodies and bodies
    /// without a message are not errors.
    pub fn detect(body: &[u8]) -> Option<Self> {
        if body.is_empty() {
            return None;
        }
        serde_json::from_slice::<ApiError>(body)
            .ok()
            .filter(|err| !err.message.is_empty())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("cache entry already exists ({status}): {source}")]
    Conflict { status: StatusCode, source: ApiError },

    #[error("cache service error ({status}): {source}")]
    Api { status: StatusCode, source: ApiError },

    #[error("unexpected HTTP status {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to decode response {body:?}: {source}")]
    Decode {
        source: serde_json::Error,
        body: String,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("failed to read blob: {0:#}")]
    Blob(#[source] anyhow::Error),

    #[error("uploaded {uploaded} bytes but blob declares {declared}")]
    SizeMismatch { declared: u64, uploaded: u64 },

    #[error("mutator failed: {0:#}")]
    Mutator(#[source] anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl CacheError {
    /// Builds the error for a response carrying a structured body.
    pub(crate) fn from_api(status: StatusCode, source: ApiError) -> Self {
        if status == StatusCode::CONFLICT || source.type_key == ALREADY_EXISTS_TYPE_KEY {
            Self::Conflict { status, source }
        } else {
            Self::Api { status, source }
        }
    }

    /// The exact key already has a committed or reserved object.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Conflict { source, .. } | Self::Api { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Conflict { status, .. } | Self::Api { status, .. } | Self::Http { status, .. } => {
                Some(*status)
            }
            Self::Transport(err) => err.status(),
            _ => None,
        }
    }
}

impl From<figment::Error> for CacheError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Fails with the service's structured error if `body` carries one, or with a
/// plain HTTP error for any other non-success status.
pub(crate) fn check_response(status: StatusCode, body: &[u8]) -> Result<()> {
    if let Some(api) = ApiError::detect(body) {
        return Err(CacheError::from_api(status, api));
    }
    if !status.is_success() {
        return Err(CacheError::Http {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }
    Ok(())
}
