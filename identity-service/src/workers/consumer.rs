//! Moves broker deliveries into the inbox table.
//!
//! A message is acknowledged only after its inbox row committed, so a crash
//! in between means redelivery, which the inbox absorbs by event id.

use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::{EventBox, EventMessage, EventRecord};
use crate::services::events::INBOUND_TOPICS;
use crate::services::{Broker, BrokerError, Delivery, Storage, StorageError, Subscription};

/// Stores an inbound message in the inbox. Returns `false` for a duplicate.
pub async fn persist_inbound(
    storage: &dyn Storage,
    message: EventMessage,
) -> Result<bool, StorageError> {
    let mut tx = storage.begin().await?;
    let record = EventRecord::pending(message, Utc::now());
    let inserted = tx.enqueue_event(EventBox::Inbox, &record).await?;
    tx.commit().await?;

    if inserted {
        tracing::debug!(
            event_id = %record.event_id,
            event_type = %record.event_type,
            topic = %record.topic,
            "Inbound event stored"
        );
    } else {
        tracing::debug!(event_id = %record.event_id, "Duplicate inbound event ignored");
    }
    Ok(inserted)
}

fn unbounded_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    }
}

pub struct InboxConsumer {
    storage: Arc<dyn Storage>,
    broker: Arc<dyn Broker>,
    group_id: String,
}

impl InboxConsumer {
    pub fn new(storage: Arc<dyn Storage>, broker: Arc<dyn Broker>, group_id: &str) -> Self {
        Self {
            storage,
            broker,
            group_id: group_id.to_string(),
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let Some(mut subscription) = self.subscribe(&shutdown).await else {
            return;
        };

        tracing::info!(group_id = %self.group_id, topics = ?INBOUND_TOPICS, "Inbox consumer started");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = subscription.next() => delivery,
            };

            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to receive from broker");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            // Without an id the row could never be deduplicated, so it is dropped.
            if delivery.message.headers.event_id.is_nil() {
                tracing::warn!(
                    topic = %delivery.topic,
                    offset = delivery.offset,
                    "Inbound message without event id skipped"
                );
                self.commit(subscription.as_mut(), &delivery).await;
                continue;
            }

            let stored = tokio::select! {
                // Not committed, so the message is redelivered after restart.
                _ = shutdown.cancelled() => break,
                stored = retry(unbounded_backoff(), || async {
                    persist_inbound(self.storage.as_ref(), delivery.message.clone())
                        .await
                        .map_err(|e| {
                            tracing::warn!(
                                event_id = %delivery.message.headers.event_id,
                                error = %e,
                                "Failed to store inbound event, retrying"
                            );
                            backoff::Error::transient(e)
                        })
                }) => stored,
            };

            match stored {
                Ok(_) => self.commit(subscription.as_mut(), &delivery).await,
                Err(e) => {
                    tracing::error!(
                        event_id = %delivery.message.headers.event_id,
                        error = %e,
                        "Giving up on inbound event without acknowledging it"
                    );
                }
            }
        }

        tracing::info!(group_id = %self.group_id, "Inbox consumer stopped");
    }

    async fn subscribe(&self, shutdown: &CancellationToken) -> Option<Box<dyn Subscription>> {
        let attempt = retry(unbounded_backoff(), || async {
            match self.broker.subscribe(&INBOUND_TOPICS, &self.group_id).await {
                Ok(subscription) => Ok(subscription),
                Err(e @ BrokerError::Unsupported(_)) => Err(backoff::Error::permanent(e)),
                Err(e) => {
                    tracing::warn!(error = %e, "Broker subscription failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        });

        let result = tokio::select! {
            _ = shutdown.cancelled() => return None,
            result = attempt => result,
        };

        match result {
            Ok(subscription) => Some(subscription),
            Err(BrokerError::Unsupported(name)) => {
                tracing::info!(broker = name, "Broker pushes to the intake route; consumer idle");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Broker subscription failed");
                None
            }
        }
    }

    async fn commit(&self, subscription: &mut dyn Subscription, delivery: &Delivery) {
        if let Err(e) = subscription.commit(delivery).await {
            tracing::warn!(
                topic = %delivery.topic,
                offset = delivery.offset,
                error = %e,
                "Failed to commit broker offset"
            );
        }
    }
}
