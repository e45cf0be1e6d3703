//! Event box rows shared by the outbox and the inbox tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Which event table an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventBox {
    Outbox,
    Inbox,
}

impl EventBox {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventBox::Outbox => "outbox",
            EventBox::Inbox => "inbox",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EventBox::Outbox => "outbox_events",
            EventBox::Inbox => "inbox_events",
        }
    }
}

impl std::str::FromStr for EventBox {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "outbox" => Ok(EventBox::Outbox),
            "inbox" => Ok(EventBox::Inbox),
            _ => Err(format!("Invalid event box: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Done => "done",
            EventStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event status: {0}")]
pub struct UnknownEventStatus(pub String);

impl TryFrom<String> for EventStatus {
    type Error = UnknownEventStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "done" => Ok(EventStatus::Done),
            "failed" => Ok(EventStatus::Failed),
            _ => Err(UnknownEventStatus(value)),
        }
    }
}

/// Metadata carried next to every payload on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeaders {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: i32,
    pub producer: String,
    pub content_type: String,
}

/// A message as brokers see it: topic, partition key, payload and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: EventHeaders,
}

/// Row of `outbox_events` or `inbox_events`.
///
/// `seq` is assigned by storage on insert and orders rows within a table.
#[derive(Debug, Clone, FromRow)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub seq: i64,
    pub topic: String,
    pub event_key: String,
    pub event_type: String,
    pub event_version: i32,
    pub producer: String,
    pub content_type: String,
    pub payload: Vec<u8>,
    #[sqlx(try_from = "String")]
    pub status: EventStatus,
    pub attempts: i32,
    pub next_attempt_utc: DateTime<Utc>,
    pub processing_id: Option<String>,
    pub last_error: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub finished_utc: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// A new pending row for `message`, due immediately.
    pub fn pending(message: EventMessage, now: DateTime<Utc>) -> Self {
        Self {
            event_id: message.headers.event_id,
            seq: 0,
            topic: message.topic,
            event_key: message.key,
            event_type: message.headers.event_type,
            event_version: message.headers.event_version,
            producer: message.headers.producer,
            content_type: message.headers.content_type,
            payload: message.payload,
            status: EventStatus::Pending,
            attempts: 0,
            next_attempt_utc: now,
            processing_id: None,
            last_error: None,
            created_utc: now,
            finished_utc: None,
        }
    }

    pub fn headers(&self) -> EventHeaders {
        EventHeaders {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            event_version: self.event_version,
            producer: self.producer.clone(),
            content_type: self.content_type.clone(),
        }
    }

    pub fn to_message(&self) -> EventMessage {
        EventMessage {
            topic: self.topic.clone(),
            key: self.event_key.clone(),
            payload: self.payload.clone(),
            headers: self.headers(),
        }
    }
}

/// Terminal or intermediate outcome recorded for a claimed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Published or applied; the row is finished.
    Done,
    /// Transient failure: charge one attempt and retry after `next_attempt_utc`.
    Retry {
        next_attempt_utc: DateTime<Utc>,
        error: String,
    },
    /// Permanent failure: charge one attempt and park the row for operators.
    Park { error: String },
    /// Hand the claim back untouched, without charging an attempt.
    Release,
}
