use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Problems with the filter taxonomy. Always raised before any network call.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read filter catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("filter catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("filter catalog is malformed: {0}")]
    MissingCategory(String),

    #[error("category `{category}` contains an empty query at position {position}")]
    EmptyQuery { category: String, position: usize },

    #[error("unknown filter category `{0}`")]
    UnknownCategory(String),
}

/// Failure of a single search-backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("search backend rejected the credential: {0}")]
    Auth(String),

    #[error("search backend rate limit hit: {0}")]
    RateLimited(String),

    #[error("search backend error: {0}")]
    Transient(String),

    #[error("search backend rejected the query: {0}")]
    InvalidQuery(String),
}

impl SearchError {
    /// Whether another attempt after a backoff can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SearchError::RateLimited(_) | SearchError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {path} could not be (de)serialized: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration values outside their allowed range.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("a search-backend API key is required")]
    MissingApiKey,

    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("verification timeout must be within 0.5s..=60s, got {0:?}")]
    Timeout(Duration),

    #[error("at least one {0} must be configured")]
    Empty(&'static str),

    #[error("unsupported URL scheme `{0}`")]
    Scheme(String),
}

/// Errors that abort a whole phase.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("discovery aborted, credential rejected: {0}")]
    Credential(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to write report: {0}")]
    Report(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
