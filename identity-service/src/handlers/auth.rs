//! Public authentication endpoints: registration, login and refresh.

use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        account::AccountResponse,
        auth::{
            LoginEmailRequest, LoginUsernameRequest, RefreshRequest, RegisterRequest,
            TokensResponse,
        },
        ErrorResponse,
    },
    models::Role,
    services::{metrics::record_auth_operation, RegisterParams},
    utils::ValidatedJson,
    AppState,
};

/// Register a new account with the `user` role.
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = AccountResponse),
        (status = 400, description = "Username or password not allowed", body = ErrorResponse),
        (status = 409, description = "Email or username already taken", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    let result = state
        .auth_service
        .register(RegisterParams {
            email: req.email,
            username: req.username,
            password: req.password,
            role: Role::User.to_string(),
        })
        .await;
    record_auth_operation("register", &result);
    let (account, _) = result?;

    Ok((StatusCode::CREATED, Json(account.into())))
}

#[utoipa::path(
    post,
    path = "/auth/login/email",
    request_body = LoginEmailRequest,
    responses(
        (status = 200, description = "Login successful", body = TokensResponse),
        (status = 401, description = "Unknown account or wrong password", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn login_by_email(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginEmailRequest>,
) -> Result<Json<TokensResponse>, AppError> {
    let result = state
        .auth_service
        .login_by_email(&req.email, &req.password)
        .await;
    record_auth_operation("login_email", &result);

    Ok(Json(result?.into()))
}

#[utoipa::path(
    post,
    path = "/auth/login/username",
    request_body = LoginUsernameRequest,
    responses(
        (status = 200, description = "Login successful", body = TokensResponse),
        (status = 401, description = "Unknown account or wrong password", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn login_by_username(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginUsernameRequest>,
) -> Result<Json<TokensResponse>, AppError> {
    let result = state
        .auth_service
        .login_by_username(&req.username, &req.password)
        .await;
    record_auth_operation("login_username", &result);

    Ok(Json(result?.into()))
}

/// Exchange a refresh token for a new pair. The presented token stops
/// working once this succeeds.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Tokens rotated", body = TokensResponse),
        (status = 401, description = "Invalid token, account or session", body = ErrorResponse),
        (status = 403, description = "Refresh token was already used", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn refresh(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<Json<TokensResponse>, AppError> {
    let result = state.auth_service.refresh(&req.refresh_token).await;
    record_auth_operation("refresh", &result);

    Ok(Json(result?.into()))
}
