use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::models::EventRecord;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AdminRegisterRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "operator@example.com")]
    pub email: String,

    #[validate(length(min = 3, max = 32, message = "Username must be 3-32 characters"))]
    #[schema(example = "operator")]
    pub username: String,

    #[validate(length(min = 8, max = 32, message = "Password must be 8-32 characters"))]
    pub password: String,

    #[schema(example = "admin")]
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EventRecordResponse {
    pub event_id: Uuid,
    #[schema(example = "accounts.v1")]
    pub topic: String,
    pub key: String,
    #[schema(example = "account.created")]
    pub event_type: String,
    pub event_version: i32,
    pub producer: String,
    #[schema(example = "failed")]
    pub status: String,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub processing_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<EventRecord> for EventRecordResponse {
    fn from(record: EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            topic: record.topic,
            key: record.event_key,
            event_type: record.event_type,
            event_version: record.event_version,
            producer: record.producer,
            status: record.status.as_str().to_string(),
            attempts: record.attempts,
            next_attempt_at: record.next_attempt_utc,
            processing_id: record.processing_id,
            last_error: record.last_error,
            created_at: record.created_utc,
            finished_at: record.finished_utc,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct FailedEventsQuery {
    /// Maximum rows returned, 1-500 (default 50)
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ReleaseRequest {
    #[validate(length(min = 1, message = "At least one process id is required"))]
    #[schema(example = json!(["identity-svc-outbox-0-host"]))]
    pub process_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AffectedRowsResponse {
    pub affected: u64,
}
