//! Error types for the ingestion pipeline and its HTTP surface

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::catalog::CatalogError;
use crate::decoder::DecodeError;
use crate::storage::StorageError;

/// Top-level error for pipeline, retrieval and handler code.
///
/// Implements [`IntoResponse`] so handlers can return it directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad or missing request input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Requested entity is absent. Read path only.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Ingestion was cancelled before the video could be finalized.
    #[error("ingest of video {video_id} cancelled before finalization")]
    Cancelled { video_id: i64 },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::Catalog(CatalogError::NotFound { .. }) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::Catalog(CatalogError::ForeignKey { .. })
            | Error::Catalog(CatalogError::DuplicateFrame { .. }) => {
                (StatusCode::CONFLICT, "INTEGRITY_ERROR")
            }
            Error::Decode(_) => (StatusCode::UNPROCESSABLE_ENTITY, "DECODE_ERROR"),
            Error::Storage(_) => (StatusCode::BAD_GATEWAY, "STORAGE_ERROR"),
            Error::Cancelled { .. } => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED"),
            Error::Catalog(CatalogError::Database(_)) | Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Internal error");
            "An internal error occurred".to_string()
        } else {
            if status.is_server_error() {
                tracing::warn!(error = %self, code, "Request failed");
            }
            self.to_string()
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
