//! Error taxonomy for the indexing and retrieval engine.
//!
//! Every failure the engine can surface maps onto one [`RetrievalError`]
//! variant. The variants fall into three handling classes:
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Fatal | `Configuration`, `DimensionMismatch` | surfaced immediately, never retried |
//! | Retryable | `EmbeddingFailure`, `VectorStoreFailure` | retried with backoff by the HTTP layer |
//! | Propagated | `ItemSource`, `State` | returned to the caller of the indexing pass |

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Missing credential, unknown backend, invalid setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The vector collection or the embedding endpoint disagrees with the
    /// configured embedding dimension.
    #[error("embedding dimension mismatch: expected {expected}, found {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding endpoint failed after all retries.
    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    /// The vector store failed after all retries.
    #[error("vector store unavailable: {0}")]
    VectorStoreFailure(String),

    /// The issue/ticket platform API failed.
    #[error("item source failed: {0}")]
    ItemSource(String),

    /// Reading or writing an index marker failed.
    #[error("index state error: {0}")]
    State(String),
}

impl RetrievalError {
    /// Configuration problems abort the request; nothing else does on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RetrievalError::Configuration(_) | RetrievalError::DimensionMismatch { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetrievalError::EmbeddingFailure(_) | RetrievalError::VectorStoreFailure(_)
        )
    }
}

impl From<sqlx::Error> for RetrievalError {
    fn from(err: sqlx::Error) -> Self {
        RetrievalError::VectorStoreFailure(err.to_string())
    }
}
