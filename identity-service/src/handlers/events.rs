//! Push intake for producers that deliver events over HTTP.

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        events::{EventIntakeRequest, EventIntakeResponse},
        ErrorResponse,
    },
    services::hashes_match,
    utils::ValidatedJson,
    workers::persist_inbound,
    AppState,
};

pub const EVENTS_TOKEN_HEADER: &str = "x-events-token";

/// Store an inbound event in the inbox. Redelivering an event id that is
/// already stored is accepted and has no effect.
#[utoipa::path(
    post,
    path = "/internal/events",
    request_body = EventIntakeRequest,
    responses(
        (status = 202, description = "Event accepted", body = EventIntakeResponse),
        (status = 401, description = "Missing or wrong intake token", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Events",
    security(("events_token" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<EventIntakeRequest>,
) -> Result<(StatusCode, Json<EventIntakeResponse>), AppError> {
    let presented = headers
        .get(EVENTS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let expected = &state.config.security.events_intake_token;

    if expected.is_empty() || !hashes_match(expected, presented) {
        tracing::warn!("Event intake called with an invalid token");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid events token"
        )));
    }

    if req.headers.event_id.is_nil() {
        return Err(AppError::BadRequest(anyhow::anyhow!("Event id must not be nil")));
    }

    let message = req
        .into_message()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid payload: {}", e)))?;
    let event_id = message.headers.event_id;
    let stored = persist_inbound(state.storage.as_ref(), message)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EventIntakeResponse { event_id, stored }),
    ))
}
