//! Publishes committed outbox rows to the broker.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::schedule::{idle_sleep, next_attempt_at, AdaptiveBatch};
use super::{acquire_slots, process_id};
use crate::config::WorkerConfig;
use crate::models::{EventBox, EventRecord, Settlement};
use crate::services::metrics::record_outbox_event;
use crate::services::{Broker, Storage, StorageError};

/// Outcome counts of one relay batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub parked: usize,
    pub released: usize,
}

pub struct OutboxRelay {
    storage: Arc<dyn Storage>,
    broker: Arc<dyn Broker>,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    service_name: String,
}

impl OutboxRelay {
    pub fn new(
        storage: Arc<dyn Storage>,
        broker: Arc<dyn Broker>,
        config: WorkerConfig,
        service_name: &str,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.slots));
        Self {
            storage,
            broker,
            config,
            slots,
            service_name: service_name.to_string(),
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.routines)
            .map(|worker_id| {
                let relay = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { relay.run(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn run(&self, worker_id: usize, shutdown: CancellationToken) {
        let process_id = process_id(&self.service_name, "outbox", worker_id);
        let mut batch = AdaptiveBatch::new(self.config.min_batch, self.config.max_batch);

        tracing::info!(worker_id, process_id = %process_id, "Outbox relay started");

        match self.release_own_claims(&process_id).await {
            Ok(0) => {}
            Ok(released) => tracing::warn!(
                worker_id,
                released,
                "Released outbox rows left claimed by a previous run"
            ),
            Err(e) => tracing::error!(
                worker_id,
                error = %e,
                "Failed to release leftover outbox claims"
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
                        tracing::debug!(worker_id, ?stats, "Outbox batch relayed");
                    }
                    stats.claimed
                }
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Outbox claim failed");
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

        tracing::info!(worker_id, process_id = %process_id, "Outbox relay stopped");
    }

    /// Returns rows still marked `processing` under `process_id` to
    /// `pending`. Process ids are stable across restarts, so these can only
    /// be leftovers of an earlier run of this same worker.
    pub async fn release_own_claims(&self, process_id: &str) -> Result<u64, StorageError> {
        let mut tx = self.storage.begin().await?;
        let released = tx
            .release_processing_events(EventBox::Outbox, &[process_id.to_string()])
            .await?;
        tx.commit().await?;
        Ok(released)
    }

    /// Claims up to `limit` rows and publishes them in order. After a
    /// failure the rest of that key's rows go back to pending untouched,
    /// so a later event never overtakes an earlier one.
    pub async fn run_once(
        &self,
        process_id: &str,
        limit: usize,
        shutdown: &CancellationToken,
    ) -> Result<RelayStats, StorageError> {
        let claimed = {
            let mut tx = self.storage.begin().await?;
            let rows = tx.claim_outbox(process_id, limit as i64, Utc::now()).await?;
            tx.commit().await?;
            rows
        };

        let mut stats = RelayStats {
            claimed: claimed.len(),
            ..Default::default()
        };
        let mut halted_keys: HashSet<String> = HashSet::new();

        for record in claimed {
            if shutdown.is_cancelled() || halted_keys.contains(&record.event_key) {
                self.settle(record.event_id, Settlement::Release).await;
                stats.released += 1;
                continue;
            }

            match self.broker.publish(&record.to_message()).await {
                Ok(()) => {
                    self.settle(record.event_id, Settlement::Done).await;
                    record_outbox_event(&record.topic, "published");
                    stats.published += 1;
                    tracing::debug!(
                        event_id = %record.event_id,
                        event_type = %record.event_type,
                        key = %record.event_key,
                        "Outbox event published"
                    );
                }
                Err(e) => {
                    halted_keys.insert(record.event_key.clone());
                    let settlement = self.failure_settlement(&record, e.to_string());
                    if matches!(settlement, Settlement::Park { .. }) {
                        stats.parked += 1;
                        record_outbox_event(&record.topic, "parked");
                        tracing::error!(
                            event_id = %record.event_id,
                            attempts = record.attempts + 1,
                            error = %e,
                            "Outbox event parked after exhausting attempts"
                        );
                    } else {
                        stats.retried += 1;
                        record_outbox_event(&record.topic, "retried");
                        tracing::warn!(
                            event_id = %record.event_id,
                            attempts = record.attempts + 1,
                            error = %e,
                            "Outbox publish failed, will retry"
                        );
                    }
                    self.settle(record.event_id, settlement).await;
                }
            }
        }

        Ok(stats)
    }

    fn failure_settlement(&self, record: &EventRecord, error: String) -> Settlement {
        let attempts = record.attempts + 1;
        if attempts >= self.config.max_attempts {
            Settlement::Park { error }
        } else {
            Settlement::Retry {
                next_attempt_utc: next_attempt_at(Utc::now(), attempts, &self.config),
                error,
            }
        }
    }

    async fn settle(&self, event_id: Uuid, settlement: Settlement) {
        let result = async {
            let mut tx = self.storage.begin().await?;
            tx.settle_event(EventBox::Outbox, event_id, &settlement, Utc::now())
                .await?;
            tx.commit().await
        }
        .await;

        if let Err(e) = result {
            tracing::error!(
                event_id = %event_id,
                ?settlement,
                error = %e,
                "Failed to record outbox outcome; row stays claimed until released"
            );
        }
    }
}
