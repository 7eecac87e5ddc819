use thiserror::Error;

/// Result type for batch lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by `Batcher` operations.
///
/// Nothing is retried internally: a failed `create` or `read` call is fatal to
/// that call and the caller decides when (and whether) to call again. The
/// idempotent storage contract makes wholesale retry safe.
#[derive(Debug, Error)]
pub enum Error {
    /// Talking to the provider failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Persisting to storage failed
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Network or API failure while talking to a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider returned a non-success status code
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a result stream failed mid-flight
    #[error("I/O error reading result stream: {0}")]
    Io(#[from] std::io::Error),

    /// Object store put/get failed
    #[error("object store error: {0}")]
    ObjectStore(String),
}

/// Storage I/O failure.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Database operation failed
    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded into the entity model
    #[error("storage backend error: {0}")]
    Backend(String),
}
