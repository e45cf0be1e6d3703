//! Local projection of organizations and their members, fed by inbound events.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Organization replica.
#[derive(Debug, Clone, FromRow)]
pub struct Organization {
    pub organization_id: Uuid,
    pub source_created_utc: DateTime<Utc>,
    pub replica_created_utc: DateTime<Utc>,
}

/// Organization member replica.
#[derive(Debug, Clone, FromRow)]
pub struct OrgMember {
    pub member_id: Uuid,
    pub account_id: Uuid,
    pub organization_id: Uuid,
    pub position: Option<String>,
    pub label: Option<String>,
    pub source_created_utc: DateTime<Utc>,
    pub replica_created_utc: DateTime<Utc>,
}
