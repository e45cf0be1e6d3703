mod common;

use common::{shutdown_token, test_config, TestApp};
use identity_service::{
    config::WorkerConfig,
    models::{EventBox, EventStatus},
    services::{events, EventBoxService, ServiceError, Storage},
    workers::process_id,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn relay_publishes_and_marks_done() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    let account_id = app.register("user@example.com", "alice").await;

    let stats = app
        .relay()
        .run_once("test-outbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.published, 1);

    let published = app.broker.published(events::ACCOUNTS_TOPIC_V1);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, account_id.to_string());
    assert_eq!(published[0].headers.event_type, events::ACCOUNT_CREATED);
    assert_eq!(published[0].headers.producer, events::PRODUCER);

    let outbox = app.storage.events(EventBox::Outbox).await;
    assert_eq!(outbox[0].status, EventStatus::Done);
    assert!(outbox[0].finished_utc.is_some());
    assert!(outbox[0].processing_id.is_none());

    let again = app
        .relay()
        .run_once("test-outbox", 10, &shutdown_token())
        .await?;
    assert_eq!(again.claimed, 0);
    Ok(())
}

#[tokio::test]
async fn failed_publish_holds_back_later_events_of_the_same_key() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    let (actor, _) = app.signed_in("user@example.com", "alice").await;
    app.auth.update_username(&actor, "alice_2").await?;
    app.register("bob@example.com", "bob").await;

    app.broker.fail_next_publishes(1);
    let stats = app
        .relay()
        .run_once("test-outbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.claimed, 3);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(stats.published, 1);

    let outbox = app.storage.events(EventBox::Outbox).await;
    let first = &outbox[0];
    assert_eq!(first.status, EventStatus::Pending);
    assert_eq!(first.attempts, 1);
    assert!(first.next_attempt_utc > chrono::Utc::now());
    assert!(first.last_error.is_some());
    assert_eq!(outbox[1].status, EventStatus::Pending);
    assert_eq!(outbox[1].attempts, 0);
    assert_eq!(outbox[2].status, EventStatus::Done);

    // The retried head blocks its key until it is due again.
    let blocked = app
        .relay()
        .run_once("test-outbox", 10, &shutdown_token())
        .await?;
    assert_eq!(blocked.claimed, 0);

    let published = app.broker.published(events::ACCOUNTS_TOPIC_V1);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, outbox[2].event_key);
    Ok(())
}

#[tokio::test]
async fn exhausted_events_are_parked_and_can_be_purged() -> Result<(), anyhow::Error> {
    let mut config = test_config();
    config.outbox = WorkerConfig {
        max_attempts: 1,
        ..WorkerConfig::default()
    };
    let app = TestApp::with_config(config);
    app.register_with_role("root@example.com", "root", "admin")
        .await;
    let admin = app.signer_actor(&app.login("root@example.com").await.access_token)?;

    app.broker.fail_next_publishes(1);
    let stats = app
        .relay()
        .run_once("test-outbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.parked, 1);
    assert!(app.broker.published(events::ACCOUNTS_TOPIC_V1).is_empty());

    let service = EventBoxService::new(app.storage.clone());
    let failed = service
        .list_failed(&admin, EventBox::Outbox, None)
        .await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, EventStatus::Failed);
    assert_eq!(failed[0].attempts, 1);
    assert!(failed[0].last_error.is_some());

    let purged = service.purge_failed(&admin, EventBox::Outbox).await?;
    assert_eq!(purged, 1);
    assert!(service
        .list_failed(&admin, EventBox::Outbox, Some(10))
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelled_relay_releases_claimed_rows() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    app.register("user@example.com", "alice").await;

    let token = shutdown_token();
    token.cancel();
    let stats = app.relay().run_once("test-outbox", 10, &token).await?;
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.released, 1);
    assert!(app.broker.published(events::ACCOUNTS_TOPIC_V1).is_empty());

    let outbox = app.storage.events(EventBox::Outbox).await;
    assert_eq!(outbox[0].status, EventStatus::Pending);
    assert_eq!(outbox[0].attempts, 0);
    Ok(())
}

#[tokio::test]
async fn stuck_rows_are_released_by_process_id() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    app.register_with_role("root@example.com", "root", "admin")
        .await;
    let admin = app.signer_actor(&app.login("root@example.com").await.access_token)?;

    let mut tx = app.storage.begin().await?;
    let claimed = tx
        .claim_outbox("crashed-worker", 10, chrono::Utc::now())
        .await?;
    tx.commit().await?;
    assert_eq!(claimed.len(), 1);

    let service = EventBoxService::new(app.storage.clone());
    let released = service
        .release(&admin, EventBox::Outbox, &["other-worker".to_string()])
        .await?;
    assert_eq!(released, 0);
    let released = service
        .release(&admin, EventBox::Outbox, &["crashed-worker".to_string()])
        .await?;
    assert_eq!(released, 1);

    let stats = app
        .relay()
        .run_once("test-outbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.published, 1);
    Ok(())
}

#[tokio::test]
async fn restarted_relay_picks_up_its_own_abandoned_claims() -> Result<(), anyhow::Error> {
    let mut config = test_config();
    config.outbox = WorkerConfig {
        routines: 1,
        min_sleep_ms: 5,
        max_sleep_ms: 10,
        ..WorkerConfig::default()
    };
    let app = TestApp::with_config(config);
    let account_id = app.register("user@example.com", "alice").await;

    // A previous run of worker 0 claimed the row and died before settling it.
    let own_id = process_id(&app.config.service_name, "outbox", 0);
    let mut tx = app.storage.begin().await?;
    let claimed = tx.claim_outbox(&own_id, 10, chrono::Utc::now()).await?;
    tx.commit().await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(
        app.relay()
            .run_once("test-outbox", 10, &shutdown_token())
            .await?
            .claimed,
        0
    );

    let token = shutdown_token();
    let handles = Arc::new(app.relay()).spawn(token.clone());
    let published = tokio::time::timeout(Duration::from_secs(5), async {
        while app.broker.published(events::ACCOUNTS_TOPIC_V1).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    token.cancel();
    for handle in handles {
        handle.await?;
    }
    assert!(published.is_ok(), "relay did not recover its claim");

    let published = app.broker.published(events::ACCOUNTS_TOPIC_V1);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, account_id.to_string());
    let outbox = app.storage.events(EventBox::Outbox).await;
    assert_eq!(outbox[0].status, EventStatus::Done);
    Ok(())
}

#[tokio::test]
async fn release_own_claims_leaves_other_workers_alone() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    app.register("user@example.com", "alice").await;

    let mut tx = app.storage.begin().await?;
    tx.claim_outbox("other-worker", 10, chrono::Utc::now())
        .await?;
    tx.commit().await?;

    let relay = app.relay();
    assert_eq!(relay.release_own_claims("test-outbox").await?, 0);
    assert_eq!(relay.release_own_claims("other-worker").await?, 1);
    assert_eq!(
        app.storage.events(EventBox::Outbox).await[0].status,
        EventStatus::Pending
    );
    Ok(())
}

#[tokio::test]
async fn event_maintenance_requires_admin() {
    let app = TestApp::new();
    let (user, _) = app.signed_in("user@example.com", "alice").await;
    let service = EventBoxService::new(app.storage.clone());

    let err = service
        .list_failed(&user, EventBox::Inbox, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotEnoughRights));
    let err = service
        .purge_failed(&user, EventBox::Inbox)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotEnoughRights));
}
