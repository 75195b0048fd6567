//! Tenant bearer-token extractor. Every agent and operator endpoint
//! authenticates this way (§4.9): "Headers: tenant bearer token."

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::header::AUTHORIZATION;

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::error::ControlPlaneError;
use crate::model::Tenant;
use crate::store::Store;

pub struct TenantAuth {
    pub tenant: Tenant,
}

impl<S> FromRequestParts<AppState<S>> for TenantAuth
where
    S: Store,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState<S>) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError(ControlPlaneError::Auth("missing authorization header".into())))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError(ControlPlaneError::Auth("expected Bearer token".into())))?;

        let tenant = state
            .store
            .get_tenant_by_token(token)
            .await?
            .ok_or_else(|| ApiError(ControlPlaneError::Auth("unknown tenant token".into())))?;

        if !tenant.enabled {
            return Err(ApiError(ControlPlaneError::Auth("tenant disabled".into())));
        }

        if !state.rate_limiter.check(tenant.id) {
            return Err(ApiError(ControlPlaneError::Retriable("rate limit exceeded".into())));
        }

        Ok(TenantAuth { tenant })
    }
}
