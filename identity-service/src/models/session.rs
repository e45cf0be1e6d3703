//! Session model - one logged-in device per row, rotated on refresh.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Role;

/// Session entity. `hash_text` holds the keyed hash of the current refresh
/// token, never the token itself.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub session_id: Uuid,
    pub account_id: Uuid,
    pub hash_text: String,
    pub version: i32,
    pub last_used_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: Uuid, account_id: Uuid, hash_text: String, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            account_id,
            hash_text,
            version: 1,
            last_used_utc: now,
            created_utc: now,
        }
    }
}

/// Caller identity recovered from a verified access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountActor {
    pub account_id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
}

/// One page of a listing plus the unpaged total.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
}
