//! Operator maintenance of the outbox and inbox tables.

use std::sync::Arc;

use crate::{
    models::{AccountActor, EventBox, EventRecord, EventStatus},
    services::{auth::validate_actor, ServiceError, Storage, Transaction},
};

pub const DEFAULT_FAILED_LIMIT: i64 = 50;
pub const MAX_FAILED_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct EventBoxService {
    storage: Arc<dyn Storage>,
}

impl EventBoxService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Parked rows of `event_box`, oldest first.
    pub async fn list_failed(
        &self,
        actor: &AccountActor,
        event_box: EventBox,
        limit: Option<i64>,
    ) -> Result<Vec<EventRecord>, ServiceError> {
        let limit = limit
            .unwrap_or(DEFAULT_FAILED_LIMIT)
            .clamp(1, MAX_FAILED_LIMIT);

        let mut tx = self.storage.begin().await?;
        require_admin(tx.as_mut(), actor).await?;
        let records = tx.list_events(event_box, EventStatus::Failed, limit).await?;
        tx.rollback().await?;
        Ok(records)
    }

    pub async fn purge_failed(
        &self,
        actor: &AccountActor,
        event_box: EventBox,
    ) -> Result<u64, ServiceError> {
        let mut tx = self.storage.begin().await?;
        require_admin(tx.as_mut(), actor).await?;
        let purged = tx.purge_failed_events(event_box).await?;
        tx.commit().await?;

        tracing::info!(
            event_box = event_box.as_str(),
            purged,
            initiator = %actor.account_id,
            "Failed events purged"
        );
        Ok(purged)
    }

    /// Hands rows claimed by dead workers back to the pool.
    pub async fn release(
        &self,
        actor: &AccountActor,
        event_box: EventBox,
        process_ids: &[String],
    ) -> Result<u64, ServiceError> {
        let mut tx = self.storage.begin().await?;
        require_admin(tx.as_mut(), actor).await?;
        let released = tx
            .release_processing_events(event_box, process_ids)
            .await?;
        tx.commit().await?;

        tracing::info!(
            event_box = event_box.as_str(),
            released,
            process_ids = ?process_ids,
            "Processing events released"
        );
        Ok(released)
    }
}

async fn require_admin(
    tx: &mut dyn Transaction,
    actor: &AccountActor,
) -> Result<(), ServiceError> {
    let (account, _) = validate_actor(tx, actor).await?;
    if !account.is_admin() {
        tracing::warn!(account_id = %account.account_id, "Non-admin attempted event maintenance");
        return Err(ServiceError::NotEnoughRights);
    }
    Ok(())
}
