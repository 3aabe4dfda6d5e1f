use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Request-scoped failure kinds. Every variant is terminal for the current
/// request; nothing here is retried at this layer.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("invalid chunking configuration: {0}")]
    InvalidConfig(String),

    #[error("vector store failure: {0}")]
    Storage(String),

    #[error("collection `{0}` does not exist")]
    CollectionNotFound(String),

    #[error("no document has been ingested yet; upload a document first")]
    NoCorpusIngested,

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("answer generation failed: {0}")]
    Generation(String),
}

impl RagError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<lancedb::Error> for RagError {
    fn from(err: lancedb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Serialize, Debug)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for RagError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidInput(_)
            | Self::UnsupportedFormat(_)
            | Self::NoCorpusIngested
            | Self::CollectionNotFound(_) => StatusCode::BAD_REQUEST,
            Self::Extraction(_)
            | Self::InvalidConfig(_)
            | Self::Storage(_)
            | Self::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Storage internals go to the log, not over the wire.
        let message = match &self {
            Self::Storage(detail) => {
                error!(%detail, "vector store failure");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}
