//! REST error taxonomy and HTTP mapping.
//!
//! Every handler failure is expressed as an [`ApiError`] kind, which carries
//! its HTTP status and serializes as a JSON `{error, code}` body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::receipts::StoreError;

/// Error kinds surfaced by the REST layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request: bad ID, bad limit/skip/since, non-object body
    #[error("{0}")]
    BadRequest(String),

    /// Auth collaborator denied the request
    #[error("unauthorized")]
    Unauthorized,

    /// Requested receipt does not exist
    #[error("receipt not found")]
    NotFound,

    /// Duplicate request ID
    #[error("{0}")]
    Conflict(String),

    /// Receipt persistence is not configured
    #[error("receipt store disabled")]
    Disabled,

    /// Persistence or bus failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Disabled => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Disabled => "DISABLED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// JSON body for error responses
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        use crate::receipts::PersistenceError;
        match err {
            StoreError::KeyNotUnique
            | StoreError::Persistence(PersistenceError::KeyNotUnique) => {
                Self::Conflict(err.to_string())
            }
            StoreError::Disabled => Self::Disabled,
            other => Self::Internal(other.to_string()),
        }
    }
}
