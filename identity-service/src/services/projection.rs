//! Applies inbound organization events to the local membership projection.
//!
//! Every deletion is recorded as a tombstone before the row goes away, and
//! every creation checks the tombstones first. Each handler first locks the
//! entity it is about; a member creation also locks the member's account and
//! organization. A create and a delete for the same entity, applied in either
//! order or concurrently, end with the entity absent.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::models::{EntityType, EventRecord, OrgMember, Organization};
use crate::services::events::{
    self, OrgMemberCreatedPayload, OrgMemberDeletedPayload, OrganizationCreatedPayload,
    OrganizationDeletedPayload,
};
use crate::services::storage::{StorageError, Transaction};

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The payload can never be applied; retrying will not help.
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What applying one event did to the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projected {
    Applied,
    /// The row was already there.
    Duplicate,
    /// A tombstone says the entity is gone; the create was dropped.
    Suppressed,
    /// Nobody handles this event type.
    Ignored,
}

impl Projected {
    pub fn as_str(&self) -> &'static str {
        match self {
            Projected::Applied => "applied",
            Projected::Duplicate => "duplicate",
            Projected::Suppressed => "suppressed",
            Projected::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectionService;

impl ProjectionService {
    pub fn new() -> Self {
        Self
    }

    /// Routes an inbox row to its handler by event type.
    pub async fn apply(
        &self,
        tx: &mut dyn Transaction,
        record: &EventRecord,
        now: DateTime<Utc>,
    ) -> Result<Projected, ProjectionError> {
        match record.event_type.as_str() {
            events::ORG_MEMBER_CREATED | events::LEGACY_MEMBER_CREATED => {
                self.org_member_created(tx, decode(record)?, now).await
            }
            events::ORG_MEMBER_DELETED | events::LEGACY_MEMBER_DELETED => {
                self.org_member_deleted(tx, decode(record)?, now).await
            }
            events::ORGANIZATION_CREATED => {
                self.organization_created(tx, decode(record)?, now).await
            }
            events::ORGANIZATION_DELETED => {
                self.organization_deleted(tx, decode(record)?, now).await
            }
            other => {
                tracing::warn!(
                    event_id = %record.event_id,
                    event_type = %other,
                    topic = %record.topic,
                    "No handler for event type, skipping"
                );
                Ok(Projected::Ignored)
            }
        }
    }

    pub async fn org_member_created(
        &self,
        tx: &mut dyn Transaction,
        payload: OrgMemberCreatedPayload,
        now: DateTime<Utc>,
    ) -> Result<Projected, ProjectionError> {
        let guards = [
            (EntityType::OrganizationMember, payload.member_id),
            (EntityType::Account, payload.account_id),
            (EntityType::Organization, payload.organization_id),
        ];
        tx.lock_entities(&guards).await?;
        for (entity_type, entity_id) in guards {
            if tx.is_buried(entity_type, entity_id).await? {
                tracing::info!(
                    member_id = %payload.member_id,
                    buried_type = entity_type.as_str(),
                    buried_id = %entity_id,
                    "Stale member creation suppressed by tombstone"
                );
                return Ok(Projected::Suppressed);
            }
        }

        let member = OrgMember {
            member_id: payload.member_id,
            account_id: payload.account_id,
            organization_id: payload.organization_id,
            position: payload.position,
            label: payload.label,
            source_created_utc: payload.created_at,
            replica_created_utc: now,
        };

        if !tx.insert_org_member(&member).await? {
            tracing::debug!(member_id = %member.member_id, "Member already projected");
            return Ok(Projected::Duplicate);
        }

        tracing::info!(
            member_id = %member.member_id,
            account_id = %member.account_id,
            organization_id = %member.organization_id,
            "Member projected"
        );
        Ok(Projected::Applied)
    }

    pub async fn org_member_deleted(
        &self,
        tx: &mut dyn Transaction,
        payload: OrgMemberDeletedPayload,
        now: DateTime<Utc>,
    ) -> Result<Projected, ProjectionError> {
        tx.lock_entities(&[(EntityType::OrganizationMember, payload.member_id)])
            .await?;
        let newly_buried = tx
            .bury(EntityType::OrganizationMember, payload.member_id, now)
            .await?;
        let deleted = tx.delete_org_member(payload.member_id).await?;

        if !newly_buried && !deleted {
            tracing::debug!(member_id = %payload.member_id, "Member already buried");
            return Ok(Projected::Duplicate);
        }

        tracing::info!(member_id = %payload.member_id, deleted, "Member buried");
        Ok(Projected::Applied)
    }

    pub async fn organization_created(
        &self,
        tx: &mut dyn Transaction,
        payload: OrganizationCreatedPayload,
        now: DateTime<Utc>,
    ) -> Result<Projected, ProjectionError> {
        tx.lock_entities(&[(EntityType::Organization, payload.organization_id)])
            .await?;
        if tx
            .is_buried(EntityType::Organization, payload.organization_id)
            .await?
        {
            tracing::info!(
                organization_id = %payload.organization_id,
                "Stale organization creation suppressed by tombstone"
            );
            return Ok(Projected::Suppressed);
        }

        let organization = Organization {
            organization_id: payload.organization_id,
            source_created_utc: payload.created_at,
            replica_created_utc: now,
        };

        if !tx.insert_organization(&organization).await? {
            return Ok(Projected::Duplicate);
        }

        tracing::info!(organization_id = %organization.organization_id, "Organization projected");
        Ok(Projected::Applied)
    }

    /// Buries the organization and all of its current members in the
    /// caller's transaction.
    pub async fn organization_deleted(
        &self,
        tx: &mut dyn Transaction,
        payload: OrganizationDeletedPayload,
        now: DateTime<Utc>,
    ) -> Result<Projected, ProjectionError> {
        let organization_id = payload.organization_id;
        tx.lock_entities(&[(EntityType::Organization, organization_id)])
            .await?;

        let newly_buried = tx
            .bury(EntityType::Organization, organization_id, now)
            .await?;
        let buried_members = tx.bury_organization_members(organization_id, now).await?;
        let deleted_members = tx.delete_organization_members(organization_id).await?;
        let deleted = tx.delete_organization(organization_id).await?;

        if !newly_buried && !deleted && deleted_members == 0 {
            tracing::debug!(organization_id = %organization_id, "Organization already buried");
            return Ok(Projected::Duplicate);
        }

        tracing::info!(
            organization_id = %organization_id,
            buried_members,
            deleted_members,
            "Organization buried"
        );
        Ok(Projected::Applied)
    }
}

fn decode<T: DeserializeOwned>(record: &EventRecord) -> Result<T, ProjectionError> {
    serde_json::from_slice(&record.payload).map_err(|e| {
        ProjectionError::Malformed(format!("{} payload: {}", record.event_type, e))
    })
}
