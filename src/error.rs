//! Error types for the delivery post search service.
//!
//! Only [`Error::CorpusLoad`] and [`Error::EmbeddingUnavailable`] are hard
//! failures of the search engine itself. Empty queries and corpus ids that the
//! record store cannot resolve are not errors at all: they shrink the result
//! set. Cache backend failures are recovered inside the cache layer.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The embedding snapshot is missing, corrupt or dimensionally inconsistent.
    #[error("Corpus load failed: {0}")]
    CorpusLoad(String),

    /// The embedding model never initialized; semantic search is offline.
    #[error("Semantic search is unavailable: embedding model not initialized")]
    EmbeddingUnavailable,

    /// The embedding model failed while encoding a query.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// A vector does not have the dimension the corpus was built with.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A caller supplied an argument outside the accepted domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The response cache backend could not be reached.
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    /// The record store collaborator failed.
    #[error("Record store error: {0}")]
    Store(String),

    /// A requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration could not be read, written or validated.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP API error.
    #[error("API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary encoding error: {0}")]
    Bincode(#[from] bincode::Error),
}

/// Result type for search service operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error should be reported to HTTP clients as a
    /// temporary outage rather than a bad request or a bug.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::EmbeddingUnavailable | Error::Store(_))
    }
}
