use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;

use crate::{models::AccountActor, AppState};

/// Requires a valid access token and exposes its actor to handlers.
///
/// Only the token is checked here. Whether the account and session still
/// exist is decided by the service call behind the handler.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
        })?;

    let claims = state.signer.parse_access(token).map_err(|e| {
        tracing::debug!(error = %e, "Access token rejected");
        AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token"))
    })?;

    req.extensions_mut().insert(claims.actor());

    Ok(next.run(req).await)
}

/// Extractor for the caller established by [`auth_middleware`].
pub struct AuthUser(pub AccountActor);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = parts.extensions.get::<AccountActor>().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Account actor missing from request extensions"
            ))
        })?;

        Ok(AuthUser(*actor))
    }
}
