//! API error types with HTTP response mapping.

use allocation::AllocationError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::ErrorKind;
use ranking::RankingError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client.
    BadRequest(String),
    Allocation(AllocationError),
    Saga(SagaError),
    Ranking(RankingError),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::BadRequest(_) => ErrorKind::Validation,
            ApiError::Allocation(e) => e.kind(),
            ApiError::Saga(e) => e.kind(),
            ApiError::Ranking(e) => e.kind(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Allocation(e) => e.to_string(),
            ApiError::Saga(e) => e.to_string(),
            ApiError::Ranking(e) => e.to_string(),
        }
    }
}

/// Maps an error kind to its HTTP status.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::ResourceBusy => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let message = match kind {
            ErrorKind::Internal => {
                tracing::error!(error = %self.message(), "internal server error");
                "internal server error".to_string()
            }
            _ => self.message(),
        };

        let body = serde_json::json!({ "error": message, "kind": kind.as_str() });
        (status_for(kind), axum::Json(body)).into_response()
    }
}

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        ApiError::Allocation(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<RankingError> for ApiError {
    fn from(err: RankingError) -> Self {
        ApiError::Ranking(err)
    }
}
