// Error types shared by the cache, ingestion, live and token layers.

use thiserror::Error;

/// Outbound HTTP failures.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network, DNS or timeout failure before a response arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream answered with a non-2xx status.
    #[error("upstream returned status {status} for {url}")]
    Status { status: u16, url: String },
}

/// Unrecoverable failures while building a network snapshot from the feed archive.
///
/// Variants carry rendered messages rather than source errors so a result can be
/// cloned out to every caller waiting on the same refresh.
#[derive(Debug, Clone, Error)]
pub enum IngestionError {
    #[error("feed download failed: {0}")]
    Transport(String),

    #[error("feed archive unreadable: {0}")]
    Archive(String),

    #[error("{0} not found in feed archive")]
    MissingFile(String),

    #[error("malformed feed record: {0}")]
    Validation(String),
}

impl IngestionError {
    /// Short label used in logs when the resolver descends a fallback tier.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestionError::Transport(_) => "transport",
            IngestionError::Archive(_) | IngestionError::MissingFile(_) => "archive",
            IngestionError::Validation(_) => "validation",
        }
    }
}

impl From<FetchError> for IngestionError {
    fn from(err: FetchError) -> Self {
        IngestionError::Transport(err.to_string())
    }
}

impl From<zip::result::ZipError> for IngestionError {
    fn from(err: zip::result::ZipError) -> Self {
        IngestionError::Archive(err.to_string())
    }
}

/// Live position poll failures. Logged by the fetcher, never returned to callers.
#[derive(Debug, Error)]
pub enum LiveFetchError {
    #[error("live vehicle endpoint not configured")]
    NotConfigured,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("live response could not be decoded: {0}")]
    Decode(String),
}

/// Backing-store failures. These never leave the cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache payload could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// Failures of the map-token contract, each mapped to a distinct HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("invalid map token format")]
    Malformed,

    #[error("no map token configured")]
    NotFound,

    #[error("map token could not be stored")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, IngestionError>;
