//! Typed error taxonomy (spec §7). Request handlers translate these to
//! HTTP status codes in `api::error_response`; everything else upstream
//! of the API boundary works with `anyhow::Result`, matching the
//! teacher's non-API async task style.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("retriable: {0}")]
    Retriable(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("safety violation: {0}")]
    SafetyViolation(String),
}

impl From<crate::store::StoreError> for ControlPlaneError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::Conflict => ControlPlaneError::Retriable("store write conflict".to_string()),
            crate::store::StoreError::NotFound => ControlPlaneError::NotFound("not found".to_string()),
            crate::store::StoreError::Backend(e) => ControlPlaneError::Fatal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ControlPlaneError {
    fn from(err: anyhow::Error) -> Self {
        ControlPlaneError::Fatal(err.to_string())
    }
}

impl ControlPlaneError {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlPlaneError::Validation(_) => "validation",
            ControlPlaneError::Auth(_) => "auth",
            ControlPlaneError::NotFound(_) => "not_found",
            ControlPlaneError::Conflict(_) => "conflict",
            ControlPlaneError::Retriable(_) => "retriable",
            ControlPlaneError::Fatal(_) => "fatal",
            ControlPlaneError::SafetyViolation(_) => "safety_violation",
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;
