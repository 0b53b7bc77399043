use crate::models::RankedHit;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure of a language-model or embedding endpoint.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("model endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("model request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl ModelError {
    /// Network failures and timeouts are worth one more attempt; a malformed
    /// envelope is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Unavailable(_) | ModelError::Timeout(_))
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ModelError::Malformed(error.to_string())
        } else {
            ModelError::Unavailable(error.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("write to {backend} failed: {details}")]
    Write { backend: String, details: String },

    #[error("query against {backend} failed: {details}")]
    Query { backend: String, details: String },
}

impl StoreError {
    pub fn write(backend: &str, details: impl ToString) -> Self {
        StoreError::Write {
            backend: backend.to_string(),
            details: details.to_string(),
        }
    }

    pub fn query(backend: &str, details: impl ToString) -> Self {
        StoreError::Query {
            backend: backend.to_string(),
            details: details.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("extraction response did not match schema: {0}")]
    ExtractionSchema(String),

    #[error("extraction model unavailable: {0}")]
    ExtractionUnavailable(ModelError),

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(ModelError),

    #[error("chunking failed: {0}")]
    Chunking(String),

    #[error("store write failed: {0}")]
    StoreWrite(StoreError),

    #[error("store lookup failed: {0}")]
    StoreQuery(StoreError),
}

impl From<StoreError> for IngestError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Write { .. } => IngestError::StoreWrite(error),
            StoreError::Query { .. } => IngestError::StoreQuery(error),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(String),

    #[error("store query failed: {0}")]
    StoreQuery(StoreError),

    #[error("query embedding unavailable: {0}")]
    EmbeddingUnavailable(ModelError),

    /// The model could not be reached; `hits` are the retrieved units so the
    /// caller can still show raw matches.
    #[error("answer synthesis unavailable: {details}")]
    SynthesisUnavailable {
        details: ModelError,
        hits: Vec<RankedHit>,
    },

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),
}

impl From<StoreError> for SearchError {
    fn from(error: StoreError) -> Self {
        SearchError::StoreQuery(error)
    }
}
