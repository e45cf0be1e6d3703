//! Endpoints acting on the caller's own account and sessions.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{
        account::{
            AccountResponse, DeletedSessionsResponse, EmailResponse, SessionResponse,
            SessionsPage, SessionsQuery, UpdatePasswordRequest, UpdateUsernameRequest,
        },
        ErrorResponse,
    },
    middleware::AuthUser,
    services::metrics::record_auth_operation,
    utils::ValidatedJson,
    AppState,
};

#[utoipa::path(
    get,
    path = "/me",
    responses(
        (status = 200, description = "Current account", body = AccountResponse),
        (status = 401, description = "Invalid session", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
) -> Result<Json<AccountResponse>, AppError> {
    let account = state.auth_service.get_my_account(&actor).await?;
    Ok(Json(account.into()))
}

/// Delete the caller's account. Refused while it is a member of an
/// organization.
#[utoipa::path(
    delete,
    path = "/me",
    responses(
        (status = 204, description = "Account deleted"),
        (status = 401, description = "Invalid session", body = ErrorResponse),
        (status = 409, description = "Account still belongs to an organization", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_me(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
) -> Result<StatusCode, AppError> {
    let result = state.auth_service.delete_account(&actor).await;
    record_auth_operation("delete_account", &result);
    result?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/me/email",
    responses(
        (status = 200, description = "Email bound to the account", body = EmailResponse),
        (status = 401, description = "Invalid session", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
pub async fn get_my_email(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
) -> Result<Json<EmailResponse>, AppError> {
    let email = state.auth_service.get_my_email(&actor).await?;
    Ok(Json(email.into()))
}

#[utoipa::path(
    patch,
    path = "/me/username",
    request_body = UpdateUsernameRequest,
    responses(
        (status = 200, description = "Username changed", body = AccountResponse),
        (status = 400, description = "Username not allowed", body = ErrorResponse),
        (status = 409, description = "Username already taken", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_username(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ValidatedJson(req): ValidatedJson<UpdateUsernameRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    let result = state
        .auth_service
        .update_username(&actor, &req.username)
        .await;
    record_auth_operation("update_username", &result);

    Ok(Json(result?.into()))
}

/// Change the password. Every session of the account, the current one
/// included, is logged out.
#[utoipa::path(
    patch,
    path = "/me/password",
    request_body = UpdatePasswordRequest,
    responses(
        (status = 204, description = "Password changed, sessions revoked"),
        (status = 400, description = "New password not allowed", body = ErrorResponse),
        (status = 401, description = "Wrong current password or invalid session", body = ErrorResponse),
        (status = 429, description = "Password was changed too recently", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn update_password(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ValidatedJson(req): ValidatedJson<UpdatePasswordRequest>,
) -> Result<StatusCode, AppError> {
    let result = state
        .auth_service
        .update_password(&actor, &req.old_password, &req.new_password)
        .await;
    record_auth_operation("update_password", &result);
    result?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/me/logout",
    responses(
        (status = 204, description = "Current session ended"),
        (status = 401, description = "Invalid session", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
) -> Result<StatusCode, AppError> {
    let result = state.auth_service.logout(&actor).await;
    record_auth_operation("logout", &result);
    result?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/me/sessions",
    params(SessionsQuery),
    responses(
        (status = 200, description = "Sessions of the account, newest first", body = SessionsPage),
        (status = 401, description = "Invalid session", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<SessionsPage>, AppError> {
    let page = state
        .auth_service
        .get_my_sessions(&actor, query.limit, query.offset)
        .await?;
    Ok(Json(SessionsPage::new(page, actor.session_id)))
}

#[utoipa::path(
    delete,
    path = "/me/sessions",
    responses(
        (status = 200, description = "All sessions deleted", body = DeletedSessionsResponse),
        (status = 401, description = "Invalid session", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_all_sessions(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
) -> Result<Json<DeletedSessionsResponse>, AppError> {
    let result = state.auth_service.delete_all_sessions(&actor).await;
    record_auth_operation("delete_all_sessions", &result);

    Ok(Json(DeletedSessionsResponse { deleted: result? }))
}

#[utoipa::path(
    get,
    path = "/me/sessions/{session_id}",
    params(("session_id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session", body = SessionResponse),
        (status = 401, description = "Invalid session or not the caller's session", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.auth_service.get_my_session(&actor, session_id).await?;
    Ok(Json(SessionResponse::new(session, actor.session_id)))
}

#[utoipa::path(
    delete,
    path = "/me/sessions/{session_id}",
    params(("session_id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session deleted"),
        (status = 401, description = "Invalid session or not the caller's session", body = ErrorResponse)
    ),
    tag = "Account",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn delete_session(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let result = state.auth_service.delete_session(&actor, session_id).await;
    record_auth_operation("delete_session", &result);
    result?;

    Ok(StatusCode::NO_CONTENT)
}
