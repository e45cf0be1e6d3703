use axum::{extract::Request, middleware::Next, response::Response};
use service_core::error::AppError;

use crate::models::{AccountActor, Role};

/// Rejects callers whose token does not carry the admin role.
///
/// Must run after `auth_middleware`. Services re-check the role against
/// the stored account, this only turns obvious non-admins away early.
pub async fn require_admin(request: Request, next: Next) -> Result<Response, AppError> {
    let actor = request
        .extensions()
        .get::<AccountActor>()
        .copied()
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))?;

    if actor.role != Role::Admin {
        tracing::warn!(account_id = %actor.account_id, "Admin route called without admin role");
        return Err(AppError::Forbidden(anyhow::anyhow!("Not enough rights")));
    }

    Ok(next.run(request).await)
}
