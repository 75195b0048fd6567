//! Translates `ControlPlaneError` kinds (§7) to HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ControlPlaneError;

pub struct ApiError(pub ControlPlaneError);

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlPlaneError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlPlaneError::Auth(_) => StatusCode::UNAUTHORIZED,
            ControlPlaneError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlPlaneError::Conflict(_) => StatusCode::CONFLICT,
            ControlPlaneError::Retriable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlPlaneError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlPlaneError::SafetyViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let body = ErrorBody { error: self.0.kind(), message: self.0.to_string() };
        (status, Json(body)).into_response()
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        ApiError(err)
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(err: crate::store::StoreError) -> Self {
        ApiError(ControlPlaneError::from(err))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(ControlPlaneError::from(err))
    }
}
