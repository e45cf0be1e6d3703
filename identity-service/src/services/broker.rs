//! Message broker seam used by the outbox relay and the inbound consumer.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use service_core::observability::inject_trace_context;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use crate::models::{EventHeaders, EventMessage};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("envelope error: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("{0} does not support subscriptions")]
    Unsupported(&'static str),
}

/// JSON form of a message on HTTP transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub topic: String,
    pub key: String,
    pub headers: EventHeaders,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn from_message(message: &EventMessage) -> Result<Self, serde_json::Error> {
        Ok(Self {
            topic: message.topic.clone(),
            key: message.key.clone(),
            headers: message.headers.clone(),
            payload: serde_json::from_slice(&message.payload)?,
        })
    }

    pub fn into_message(self) -> Result<EventMessage, serde_json::Error> {
        Ok(EventMessage {
            topic: self.topic,
            key: self.key,
            payload: serde_json::to_vec(&self.payload)?,
            headers: self.headers,
        })
    }
}

/// One message handed to a subscriber, with its position in the topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub offset: u64,
    pub message: EventMessage,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends `message` to its topic; returns once the broker acknowledged it.
    async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError>;

    /// Opens a consumer-group subscription. Delivery resumes after the
    /// group's last committed offset of each topic.
    async fn subscribe(
        &self,
        topics: &[&str],
        group_id: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message.
    async fn next(&mut self) -> Result<Delivery, BrokerError>;

    /// Marks `delivery` and everything before it in its topic as consumed.
    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<EventMessage>>,
    committed: HashMap<(String, String), u64>,
}

#[derive(Default)]
struct MemoryBrokerInner {
    state: Mutex<BrokerState>,
    published: Notify,
    failing_publishes: AtomicUsize,
}

impl MemoryBrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process topic log with consumer-group offsets.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Everything appended to `topic` so far, in order.
    pub fn published(&self, topic: &str) -> Vec<EventMessage> {
        self.inner
            .state()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group_id: &str, topic: &str) -> u64 {
        self.inner
            .state()
            .committed
            .get(&(group_id.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError> {
        let failing = self
            .inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BrokerError::Publish("broker unavailable".to_string()));
        }

        self.inner
            .state()
            .topics
            .entry(message.topic.clone())
            .or_default()
            .push(message.clone());
        self.inner.published.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[&str],
        group_id: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let cursors = {
            let state = self.inner.state();
            topics
                .iter()
                .map(|topic| {
                    let committed = state
                        .committed
                        .get(&(group_id.to_string(), topic.to_string()))
                        .copied()
                        .unwrap_or(0);
                    (topic.to_string(), committed)
                })
                .collect()
        };

        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            group_id: group_id.to_string(),
            cursors,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<MemoryBrokerInner>,
    group_id: String,
    cursors: Vec<(String, u64)>,
}

impl MemorySubscription {
    fn poll(&mut self) -> Option<Delivery> {
        let state = self.inner.state();
        for (topic, cursor) in self.cursors.iter_mut() {
            let Some(message) = state
                .topics
                .get(topic.as_str())
                .and_then(|log| log.get(*cursor as usize))
            else {
                continue;
            };
            let delivery = Delivery {
                topic: topic.clone(),
                offset: *cursor,
                message: message.clone(),
            };
            *cursor += 1;
            return Some(delivery);
        }
        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Delivery, BrokerError> {
        loop {
            let inner = self.inner.clone();
            let published = inner.published.notified();
            if let Some(delivery) = self.poll() {
                return Ok(delivery);
            }
            published.await;
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.inner.state();
        let committed = state
            .committed
            .entry((self.group_id.clone(), delivery.topic.clone()))
            .or_insert(0);
        *committed = (*committed).max(delivery.offset + 1);
        Ok(())
    }
}

/// Publishes envelopes to an HTTP endpoint. Inbound traffic arrives through
/// the intake route instead of a subscription.
#[derive(Clone)]
pub struct HttpBroker {
    client: reqwest::Client,
    publish_url: String,
}

impl HttpBroker {
    pub fn new(publish_url: &str) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        tracing::info!(publish_url = %publish_url, "HTTP broker configured");

        Ok(Self {
            client,
            publish_url: publish_url.to_string(),
        })
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError> {
        let envelope = EventEnvelope::from_message(message)?;

        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);

        self.client
            .post(&self.publish_url)
            .headers(headers)
            .json(&envelope)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn subscribe(
        &self,
        _topics: &[&str],
        _group_id: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        Err(BrokerError::Unsupported("HTTP broker"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events;
    use uuid::Uuid;

    fn message(topic: &str, key: &str) -> EventMessage {
        events::json_message(
            topic,
            key.to_string(),
            "test.event",
            &serde_json::json!({ "id": Uuid::new_v4() }),
        )
        .expect("payload serializes")
    }

    #[tokio::test]
    async fn subscription_resumes_after_committed_offset() -> Result<(), BrokerError> {
        let broker = MemoryBroker::new();
        broker.publish(&message("t", "a")).await?;
        broker.publish(&message("t", "b")).await?;

        let mut sub = broker.subscribe(&["t"], "group").await?;
        let first = sub.next().await?;
        assert_eq!(first.offset, 0);
        sub.commit(&first).await?;
        let second = sub.next().await?;
        assert_eq!(second.message.key, "b");
        drop(sub);

        // The uncommitted second message is redelivered.
        let mut sub = broker.subscribe(&["t"], "group").await?;
        let again = sub.next().await?;
        assert_eq!(again.offset, 1);
        assert_eq!(broker.committed_offset("group", "t"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn next_wakes_on_publish() -> Result<(), BrokerError> {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(&["t"], "group").await?;

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = publisher.publish(&message("t", "late")).await;
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("delivery before timeout")?;
        assert_eq!(delivery.message.key, "late");
        Ok(())
    }

    #[tokio::test]
    async fn injected_failures_reject_publishes() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);
        assert!(broker.publish(&message("t", "a")).await.is_err());
        assert!(broker.publish(&message("t", "a")).await.is_ok());
        assert_eq!(broker.published("t").len(), 1);
    }

    #[test]
    fn envelope_round_trips_json_payload() -> Result<(), serde_json::Error> {
        let original = message("t", "k");
        let envelope = EventEnvelope::from_message(&original)?;
        assert_eq!(envelope.headers, original.headers);
        let restored = envelope.into_message()?;
        assert_eq!(restored.headers.event_id, original.headers.event_id);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&restored.payload)?,
            serde_json::from_slice::<serde_json::Value>(&original.payload)?
        );
        Ok(())
    }
}
