use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{EventHeaders, EventMessage};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct EventHeadersRequest {
    pub event_id: Uuid,
    #[validate(length(min = 1, message = "Event type is required"))]
    #[schema(example = "organization_member.created")]
    pub event_type: String,
    #[schema(example = 1)]
    pub event_version: i32,
    #[schema(example = "organization-svc")]
    pub producer: String,
    #[schema(example = "application/json")]
    pub content_type: String,
}

/// Event pushed by a producer that cannot reach the broker directly.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct EventIntakeRequest {
    #[validate(length(min = 1, message = "Topic is required"))]
    #[schema(example = "organization.member.v1")]
    pub topic: String,
    pub key: String,
    #[validate(nested)]
    pub headers: EventHeadersRequest,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

impl EventIntakeRequest {
    pub fn into_message(self) -> Result<EventMessage, serde_json::Error> {
        Ok(EventMessage {
            topic: self.topic,
            key: self.key,
            payload: serde_json::to_vec(&self.payload)?,
            headers: EventHeaders {
                event_id: self.headers.event_id,
                event_type: self.headers.event_type,
                event_version: self.headers.event_version,
                producer: self.headers.producer,
                content_type: self.headers.content_type,
            },
        })
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EventIntakeResponse {
    pub event_id: Uuid,
    /// `false` when the event id was already in the inbox
    pub stored: bool,
}
