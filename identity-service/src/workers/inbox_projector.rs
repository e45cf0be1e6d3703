//! Applies claimed inbox rows through the projection handlers.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::schedule::{idle_sleep, next_attempt_at, AdaptiveBatch};
use super::{acquire_slots, process_id};
use crate::config::WorkerConfig;
use crate::models::{EventBox, EventRecord, Settlement};
use crate::services::metrics::record_inbox_event;
use crate::services::{Projected, ProjectionError, ProjectionService, Storage, StorageError};

/// Outcome counts of one projector batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectorStats {
    pub claimed: usize,
    pub done: usize,
    pub retried: usize,
    pub parked: usize,
    pub released: usize,
}

pub struct InboxProjector {
    storage: Arc<dyn Storage>,
    projection: ProjectionService,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    service_name: String,
}

impl InboxProjector {
    pub fn new(
        storage: Arc<dyn Storage>,
        projection: ProjectionService,
        config: WorkerConfig,
        service_name: &str,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.slots));
        Self {
            storage,
            projection,
            config,
            slots,
            service_name: service_name.to_string(),
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.routines)
            .map(|worker_id| {
                let projector = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { projector.run(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn run(&self, worker_id: usize, shutdown: CancellationToken) {
        let process_id = process_id(&self.service_name, "inbox", worker_id);
        let mut batch = AdaptiveBatch::new(self.config.min_batch, self.config.max_batch);

        tracing::info!(worker_id, process_id = %process_id, "Inbox projector started");

        match self.release_own_claims(&process_id).await {
            Ok(0) => {}
            Ok(released) => tracing::warn!(
                worker_id,
                released,
                "Released inbox rows left claimed by a previous run"
            ),
            Err(e) => tracing::error!(
                worker_id,
                error = %e,
                "Failed to release leftover inbox claims"
            ),
        }

        while !shutdown.is_cancelled() {
            let Some((permit, limit)) = acquire_slots(&self.slots, batch.size(), &shutdown).await
            else {
                break;
            };

            let claimed = match self.run_once(&process_id, limit, &shutdown).await {
                Ok(stats) => {
                    if stats.claimed > 0 {
                        tracing::debug!(worker_id, ?stats, "Inbox batch projected");
                    }
                    stats.claimed
                }
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Inbox claim failed");
                    0
                }
            };
            drop(permit);
            batch.record(claimed, limit);

            if claimed == 0 {
                let pause = idle_sleep(self.config.min_sleep(), self.config.max_sleep());
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        tracing::info!(worker_id, process_id = %process_id, "Inbox projector stopped");
    }

    /// Returns rows still marked `processing` under `process_id` to
    /// `pending`. Process ids are stable across restarts, so these can only
    /// be leftovers of an earlier run of this same worker.
    pub async fn release_own_claims(&self, process_id: &str) -> Result<u64, StorageError> {
        let mut tx = self.storage.begin().await?;
        let released = tx
            .release_processing_events(EventBox::Inbox, &[process_id.to_string()])
            .await?;
        tx.commit().await?;
        Ok(released)
    }

    /// Claims up to `limit` rows and applies each in its own transaction
    /// together with its `done` mark.
    pub async fn run_once(
        &self,
        process_id: &str,
        limit: usize,
        shutdown: &CancellationToken,
    ) -> Result<ProjectorStats, StorageError> {
        let claimed = {
            let mut tx = self.storage.begin().await?;
            let rows = tx.claim_inbox(process_id, limit as i64, Utc::now()).await?;
            tx.commit().await?;
            rows
        };

        let mut stats = ProjectorStats {
            claimed: claimed.len(),
            ..Default::default()
        };

        for record in claimed {
            if shutdown.is_cancelled() {
                self.settle(record.event_id, Settlement::Release).await;
                stats.released += 1;
                continue;
            }

            match self.apply(&record).await {
                Ok(projected) => {
                    record_inbox_event(&record.event_type, projected.as_str());
                    stats.done += 1;
                }
                Err(e) => {
                    let settlement = self.failure_settlement(&record, &e);
                    match settlement {
                        Settlement::Park { .. } => {
                            stats.parked += 1;
                            record_inbox_event(&record.event_type, "parked");
                            tracing::error!(
                                event_id = %record.event_id,
                                event_type = %record.event_type,
                                attempts = record.attempts + 1,
                                error = %e,
                                "Inbox event parked"
                            );
                        }
                        _ => {
                            stats.retried += 1;
                            record_inbox_event(&record.event_type, "retried");
                            tracing::warn!(
                                event_id = %record.event_id,
                                event_type = %record.event_type,
                                attempts = record.attempts + 1,
                                error = %e,
                                "Inbox event failed, will retry"
                            );
                        }
                    }
                    self.settle(record.event_id, settlement).await;
                }
            }
        }

        Ok(stats)
    }

    async fn apply(&self, record: &EventRecord) -> Result<Projected, ProjectionError> {
        let now = Utc::now();
        let mut tx = self.storage.begin().await?;
        let projected = self.projection.apply(tx.as_mut(), record, now).await?;
        tx.settle_event(EventBox::Inbox, record.event_id, &Settlement::Done, now)
            .await?;
        tx.commit().await?;

        tracing::debug!(
            event_id = %record.event_id,
            event_type = %record.event_type,
            outcome = projected.as_str(),
            "Inbox event applied"
        );
        Ok(projected)
    }

    fn failure_settlement(&self, record: &EventRecord, error: &ProjectionError) -> Settlement {
        let attempts = record.attempts + 1;
        match error {
            ProjectionError::Malformed(reason) => Settlement::Park {
                error: reason.clone(),
            },
            ProjectionError::Storage(e) if attempts >= self.config.max_attempts => {
                Settlement::Park {
                    error: e.to_string(),
                }
            }
            ProjectionError::Storage(e) => Settlement::Retry {
                next_attempt_utc: next_attempt_at(Utc::now(), attempts, &self.config),
                error: e.to_string(),
            },
        }
    }

    async fn settle(&self, event_id: Uuid, settlement: Settlement) {
        let result = async {
            let mut tx = self.storage.begin().await?;
            tx.settle_event(EventBox::Inbox, event_id, &settlement, Utc::now())
                .await?;
            tx.commit().await
        }
        .await;

        if let Err(e) = result {
            tracing::error!(
                event_id = %event_id,
                ?settlement,
                error = %e,
                "Failed to record inbox outcome; row stays claimed until released"
            );
        }
    }
}
