//! Administrator endpoints: account provisioning and event box maintenance.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::{
        account::AccountResponse,
        admin::{
            AdminRegisterRequest, AffectedRowsResponse, EventRecordResponse, FailedEventsQuery,
            ReleaseRequest,
        },
        ErrorResponse,
    },
    middleware::AuthUser,
    models::EventBox,
    services::{metrics::record_auth_operation, RegisterParams},
    utils::ValidatedJson,
    AppState,
};

fn parse_event_box(raw: &str) -> Result<EventBox, AppError> {
    raw.parse()
        .map_err(|e: String| AppError::NotFound(anyhow::anyhow!(e)))
}

/// Register an account with an explicit role.
#[utoipa::path(
    post,
    path = "/admin/accounts",
    request_body = AdminRegisterRequest,
    responses(
        (status = 201, description = "Account created", body = AccountResponse),
        (status = 400, description = "Username, password or role not allowed", body = ErrorResponse),
        (status = 403, description = "Caller is not an administrator", body = ErrorResponse),
        (status = 409, description = "Email or username already taken", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn register_account(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    ValidatedJson(req): ValidatedJson<AdminRegisterRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    let result = state
        .auth_service
        .register_by_admin(
            &actor,
            RegisterParams {
                email: req.email,
                username: req.username,
                password: req.password,
                role: req.role,
            },
        )
        .await;
    record_auth_operation("register_by_admin", &result);
    let (account, _) = result?;

    Ok((StatusCode::CREATED, Json(account.into())))
}

#[utoipa::path(
    get,
    path = "/admin/events/{event_box}/failed",
    params(
        ("event_box" = String, Path, description = "`outbox` or `inbox`"),
        FailedEventsQuery
    ),
    responses(
        (status = 200, description = "Parked events, oldest first", body = [EventRecordResponse]),
        (status = 403, description = "Caller is not an administrator", body = ErrorResponse),
        (status = 404, description = "Unknown event box", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn list_failed_events(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(event_box): Path<String>,
    Query(query): Query<FailedEventsQuery>,
) -> Result<Json<Vec<EventRecordResponse>>, AppError> {
    let event_box = parse_event_box(&event_box)?;
    let records = state
        .event_box_service
        .list_failed(&actor, event_box, query.limit)
        .await?;

    Ok(Json(records.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    delete,
    path = "/admin/events/{event_box}/failed",
    params(("event_box" = String, Path, description = "`outbox` or `inbox`")),
    responses(
        (status = 200, description = "Parked events removed", body = AffectedRowsResponse),
        (status = 403, description = "Caller is not an administrator", body = ErrorResponse),
        (status = 404, description = "Unknown event box", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn purge_failed_events(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(event_box): Path<String>,
) -> Result<Json<AffectedRowsResponse>, AppError> {
    let event_box = parse_event_box(&event_box)?;
    let affected = state
        .event_box_service
        .purge_failed(&actor, event_box)
        .await?;

    Ok(Json(AffectedRowsResponse { affected }))
}

/// Return rows held by the given worker process ids to the pending pool.
#[utoipa::path(
    post,
    path = "/admin/events/{event_box}/release",
    params(("event_box" = String, Path, description = "`outbox` or `inbox`")),
    request_body = ReleaseRequest,
    responses(
        (status = 200, description = "Rows released", body = AffectedRowsResponse),
        (status = 403, description = "Caller is not an administrator", body = ErrorResponse),
        (status = 404, description = "Unknown event box", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn release_events(
    State(state): State<AppState>,
    AuthUser(actor): AuthUser,
    Path(event_box): Path<String>,
    ValidatedJson(req): ValidatedJson<ReleaseRequest>,
) -> Result<Json<AffectedRowsResponse>, AppError> {
    let event_box = parse_event_box(&event_box)?;
    let affected = state
        .event_box_service
        .release(&actor, event_box, &req.process_ids)
        .await?;

    Ok(Json(AffectedRowsResponse { affected }))
}
