mod common;

use chrono::Utc;
use common::{inbound, shutdown_token, test_config, TestApp};
use identity_service::{
    config::WorkerConfig,
    models::{EventBox, EventMessage, EventStatus},
    services::{
        events::{self, OrgMemberCreatedPayload, OrgMemberDeletedPayload},
        Broker, MemoryBroker, Storage,
    },
    workers::{persist_inbound, process_id, InboxConsumer},
};
use std::time::Duration;
use uuid::Uuid;

fn member_payload(member_id: Uuid) -> OrgMemberCreatedPayload {
    OrgMemberCreatedPayload {
        member_id,
        account_id: Uuid::new_v4(),
        organization_id: Uuid::new_v4(),
        position: None,
        label: Some("core".to_string()),
        created_at: Utc::now(),
    }
}

fn member_created(member_id: Uuid) -> EventMessage {
    inbound(
        events::ORG_MEMBER_TOPIC_V1,
        member_id,
        events::ORG_MEMBER_CREATED,
        &member_payload(member_id),
    )
}

#[tokio::test]
async fn redelivered_event_is_stored_once() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    let member_id = Uuid::new_v4();
    let message = inbound(
        events::ORG_MEMBER_TOPIC_V1,
        member_id,
        events::ORG_MEMBER_CREATED,
        &member_payload(member_id),
    );

    assert!(persist_inbound(app.storage.as_ref(), message.clone()).await?);
    assert!(!persist_inbound(app.storage.as_ref(), message).await?);
    assert_eq!(app.storage.events(EventBox::Inbox).await.len(), 1);

    let stats = app
        .projector()
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.done, 1);
    assert_eq!(app.storage.member_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn malformed_payload_is_parked_immediately() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    let message = inbound(
        events::ORG_MEMBER_TOPIC_V1,
        Uuid::new_v4(),
        events::ORG_MEMBER_CREATED,
        &serde_json::json!({ "member_id": "not-a-uuid" }),
    );
    persist_inbound(app.storage.as_ref(), message).await?;

    let stats = app
        .projector()
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.parked, 1);

    let inbox = app.storage.events(EventBox::Inbox).await;
    assert_eq!(inbox[0].status, EventStatus::Failed);
    assert_eq!(inbox[0].attempts, 1);
    assert!(inbox[0]
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains(events::ORG_MEMBER_CREATED)));
    assert_eq!(app.storage.member_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_event_type_is_marked_done() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    let message = inbound(
        events::ORGANIZATION_TOPIC_V1,
        Uuid::new_v4(),
        "organization.renamed",
        &serde_json::json!({ "name": "acme" }),
    );
    persist_inbound(app.storage.as_ref(), message).await?;

    let stats = app
        .projector()
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.done, 1);

    let inbox = app.storage.events(EventBox::Inbox).await;
    assert_eq!(inbox[0].status, EventStatus::Done);
    Ok(())
}

#[tokio::test]
async fn failed_claim_leaves_rows_pending() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    let member_id = Uuid::new_v4();
    persist_inbound(
        app.storage.as_ref(),
        inbound(
            events::ORG_MEMBER_TOPIC_V1,
            member_id,
            events::ORG_MEMBER_CREATED,
            &member_payload(member_id),
        ),
    )
    .await?;

    app.storage.fail_next_commits(1);
    let projector = app.projector();
    assert!(projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await
        .is_err());

    let inbox = app.storage.events(EventBox::Inbox).await;
    assert_eq!(inbox[0].status, EventStatus::Pending);
    assert!(inbox[0].processing_id.is_none());

    let stats = projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.done, 1);
    Ok(())
}

#[tokio::test]
async fn storage_failure_schedules_a_retry() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    persist_inbound(app.storage.as_ref(), member_created(Uuid::new_v4())).await?;

    app.storage.fail_operation("insert_org_member", 1);
    let projector = app.projector();
    let stats = projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(app.storage.member_count().await, 0);

    let inbox = app.storage.events(EventBox::Inbox).await;
    assert_eq!(inbox[0].status, EventStatus::Pending);
    assert_eq!(inbox[0].attempts, 1);
    assert!(inbox[0].next_attempt_utc > Utc::now());
    assert!(inbox[0].processing_id.is_none());
    assert!(inbox[0]
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("insert_org_member")));

    // Not due yet.
    let stats = projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.claimed, 0);
    Ok(())
}

#[tokio::test]
async fn storage_failures_retry_until_parked() -> Result<(), anyhow::Error> {
    let mut config = test_config();
    config.inbox = WorkerConfig {
        min_next_attempt_ms: 0,
        max_next_attempt_ms: 0,
        max_attempts: 3,
        ..WorkerConfig::default()
    };
    let app = TestApp::with_config(config);
    persist_inbound(app.storage.as_ref(), member_created(Uuid::new_v4())).await?;

    app.storage.fail_operation("insert_org_member", 3);
    let projector = app.projector();

    for attempt in 1..=2 {
        let stats = projector
            .run_once("test-inbox", 10, &shutdown_token())
            .await?;
        assert_eq!(stats.retried, 1, "attempt {attempt}");
        let inbox = app.storage.events(EventBox::Inbox).await;
        assert_eq!(inbox[0].status, EventStatus::Pending);
        assert_eq!(inbox[0].attempts, attempt);
    }

    let stats = projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.parked, 1);

    let inbox = app.storage.events(EventBox::Inbox).await;
    assert_eq!(inbox[0].status, EventStatus::Failed);
    assert_eq!(inbox[0].attempts, 3);
    assert!(inbox[0].finished_utc.is_some());
    assert_eq!(app.storage.member_count().await, 0);

    let stats = projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.claimed, 0);
    Ok(())
}

#[tokio::test]
async fn retried_event_applies_once_storage_recovers() -> Result<(), anyhow::Error> {
    let mut config = test_config();
    config.inbox = WorkerConfig {
        min_next_attempt_ms: 0,
        max_next_attempt_ms: 0,
        ..WorkerConfig::default()
    };
    let app = TestApp::with_config(config);
    persist_inbound(app.storage.as_ref(), member_created(Uuid::new_v4())).await?;

    app.storage.fail_operation("insert_org_member", 1);
    let projector = app.projector();
    let first = projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(first.retried, 1);

    let second = projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(second.done, 1);

    let inbox = app.storage.events(EventBox::Inbox).await;
    assert_eq!(inbox[0].status, EventStatus::Done);
    assert_eq!(inbox[0].attempts, 1);
    assert_eq!(app.storage.member_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn restarted_projector_releases_its_own_claims() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    persist_inbound(app.storage.as_ref(), member_created(Uuid::new_v4())).await?;

    let own_id = process_id(&app.config.service_name, "inbox", 0);
    let mut tx = app.storage.begin().await?;
    assert_eq!(tx.claim_inbox(&own_id, 10, Utc::now()).await?.len(), 1);
    tx.commit().await?;

    let projector = app.projector();
    let stats = projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.claimed, 0);

    assert_eq!(projector.release_own_claims(&own_id).await?, 1);
    assert_eq!(projector.release_own_claims(&own_id).await?, 0);

    let stats = projector
        .run_once("test-inbox", 10, &shutdown_token())
        .await?;
    assert_eq!(stats.done, 1);
    assert_eq!(app.storage.member_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn consumer_stores_deliveries_and_commits_offsets() -> Result<(), anyhow::Error> {
    let app = TestApp::new();
    let broker = MemoryBroker::new();
    let member_id = Uuid::new_v4();

    let created = inbound(
        events::ORG_MEMBER_TOPIC_V1,
        member_id,
        events::ORG_MEMBER_CREATED,
        &member_payload(member_id),
    );
    let mut anonymous = inbound(
        events::ORG_MEMBER_TOPIC_V1,
        member_id,
        events::ORG_MEMBER_DELETED,
        &OrgMemberDeletedPayload {
            member_id,
            deleted_at: Utc::now(),
        },
    );
    anonymous.headers.event_id = Uuid::nil();

    broker.publish(&created).await?;
    broker.publish(&created).await?;
    broker.publish(&anonymous).await?;

    let token = shutdown_token();
    let consumer = InboxConsumer::new(
        app.storage.clone(),
        std::sync::Arc::new(broker.clone()),
        "identity-svc-test",
    );
    let handle = tokio::spawn(consumer.run(token.clone()));

    let committed = tokio::time::timeout(Duration::from_secs(5), async {
        while broker.committed_offset("identity-svc-test", events::ORG_MEMBER_TOPIC_V1) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    token.cancel();
    handle.await?;
    assert!(committed.is_ok(), "consumer did not commit all offsets");

    let inbox = app.storage.events(EventBox::Inbox).await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].event_id, created.headers.event_id);
    Ok(())
}
