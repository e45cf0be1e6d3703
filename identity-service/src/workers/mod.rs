//! Background event workers: the outbox relay, the inbox projector and the
//! broker consumer feeding the inbox.

mod consumer;
mod inbox_projector;
mod outbox_relay;
pub mod schedule;

pub use consumer::{persist_inbound, InboxConsumer};
pub use inbox_projector::{InboxProjector, ProjectorStats};
pub use outbox_relay::{OutboxRelay, RelayStats};

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::IdentityConfig;
use crate::services::{Broker, ProjectionService, Storage};

/// Worker identity recorded on claimed rows:
/// `<service>-<role>-<index>-<hostname>`.
pub fn process_id(service: &str, role: &str, index: usize) -> String {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}-{}-{}", service, role, index, hostname)
}

/// Waits for up to `want` slots, taking whatever is free (at least one).
/// Returns `None` once shutdown starts.
pub(crate) async fn acquire_slots(
    slots: &Arc<Semaphore>,
    want: usize,
    shutdown: &CancellationToken,
) -> Option<(OwnedSemaphorePermit, usize)> {
    let count = slots.available_permits().clamp(1, want.max(1));
    tokio::select! {
        _ = shutdown.cancelled() => None,
        permit = slots.clone().acquire_many_owned(count as u32) => {
            permit.ok().map(|p| (p, count))
        }
    }
}

/// Starts both worker pools and the consumer on a shared shutdown token.
pub fn spawn_event_workers(
    config: &IdentityConfig,
    storage: Arc<dyn Storage>,
    broker: Arc<dyn Broker>,
    projection: ProjectionService,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let relay = Arc::new(OutboxRelay::new(
        storage.clone(),
        broker.clone(),
        config.outbox.clone(),
        &config.service_name,
    ));
    handles.extend(relay.spawn(shutdown.clone()));

    let projector = Arc::new(InboxProjector::new(
        storage.clone(),
        projection,
        config.inbox.clone(),
        &config.service_name,
    ));
    handles.extend(projector.spawn(shutdown.clone()));

    let consumer = InboxConsumer::new(storage, broker, &config.broker.consumer_group);
    handles.push(tokio::spawn(consumer.run(shutdown)));

    tracing::info!(
        outbox_routines = config.outbox.routines,
        inbox_routines = config.inbox.routines,
        "Event workers started"
    );

    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_names_service_role_and_index() {
        let id = process_id("identity-svc", "outbox", 3);
        assert!(id.starts_with("identity-svc-outbox-3-"));
    }

    #[tokio::test]
    async fn acquire_slots_takes_what_is_free() {
        let slots = Arc::new(Semaphore::new(5));
        let shutdown = CancellationToken::new();

        let (first, count) = acquire_slots(&slots, 3, &shutdown).await.expect("slots");
        assert_eq!(count, 3);
        let (_second, count) = acquire_slots(&slots, 10, &shutdown).await.expect("slots");
        assert_eq!(count, 2);
        drop(first);
        assert_eq!(slots.available_permits(), 3);

        shutdown.cancel();
        let exhausted = Arc::new(Semaphore::new(0));
        assert!(acquire_slots(&exhausted, 1, &shutdown).await.is_none());
    }
}
