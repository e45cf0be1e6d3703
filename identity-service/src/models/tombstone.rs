//! Tombstones - permanent "this id is gone" markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Account,
    Session,
    OrganizationMember,
    Organization,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Account => "account",
            EntityType::Session => "session",
            EntityType::OrganizationMember => "organization_member",
            EntityType::Organization => "organization",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown entity type: {0}")]
pub struct UnknownEntityType(pub String);

impl TryFrom<String> for EntityType {
    type Error = UnknownEntityType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "account" => Ok(EntityType::Account),
            "session" => Ok(EntityType::Session),
            "organization_member" => Ok(EntityType::OrganizationMember),
            "organization" => Ok(EntityType::Organization),
            _ => Err(UnknownEntityType(value)),
        }
    }
}

/// Tombstone row, unique on (entity_type, entity_id).
#[derive(Debug, Clone, FromRow)]
pub struct Tombstone {
    pub tombstone_id: Uuid,
    #[sqlx(try_from = "String")]
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub deleted_utc: DateTime<Utc>,
}

impl Tombstone {
    pub fn new(entity_type: EntityType, entity_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            tombstone_id: Uuid::new_v4(),
            entity_type,
            entity_id,
            deleted_utc: now,
        }
    }
}
