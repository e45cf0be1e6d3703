//! Wire contract of the events this service emits and consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Account, EventHeaders, EventMessage, Role};

/// Producer identity stamped on every outbound header.
pub const PRODUCER: &str = "identity-svc";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const EVENT_VERSION_V1: i32 = 1;

pub const ACCOUNTS_TOPIC_V1: &str = "accounts.v1";
pub const ORG_MEMBER_TOPIC_V1: &str = "organization.member.v1";
pub const ORGANIZATION_TOPIC_V1: &str = "organization.v1";

/// Topics the consumer subscribes to.
pub const INBOUND_TOPICS: [&str; 2] = [ORG_MEMBER_TOPIC_V1, ORGANIZATION_TOPIC_V1];

pub const ACCOUNT_CREATED: &str = "account.created";
pub const ACCOUNT_DELETED: &str = "account.deleted";
pub const ACCOUNT_USERNAME_UPDATED: &str = "account.username_updated";

pub const ORG_MEMBER_CREATED: &str = "organization_member.created";
pub const ORG_MEMBER_DELETED: &str = "organization_member.deleted";
pub const ORGANIZATION_CREATED: &str = "organization.created";
pub const ORGANIZATION_DELETED: &str = "organization.deleted";

// Older producers still emit these.
pub const LEGACY_MEMBER_CREATED: &str = "member.created";
pub const LEGACY_MEMBER_DELETED: &str = "member.deleted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCreatedPayload {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDeletedPayload {
    pub account_id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountUsernameUpdatedPayload {
    pub account_id: Uuid,
    pub new_username: String,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgMemberCreatedPayload {
    pub member_id: Uuid,
    pub account_id: Uuid,
    pub organization_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgMemberDeletedPayload {
    pub member_id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationCreatedPayload {
    pub organization_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationDeletedPayload {
    pub organization_id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

/// JSON-encodes `payload` into a v1 message with a fresh event id.
pub fn json_message<P: Serialize>(
    topic: &str,
    key: String,
    event_type: &str,
    payload: &P,
) -> Result<EventMessage, serde_json::Error> {
    Ok(EventMessage {
        topic: topic.to_string(),
        key,
        payload: serde_json::to_vec(payload)?,
        headers: EventHeaders {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            event_version: EVENT_VERSION_V1,
            producer: PRODUCER.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
        },
    })
}

pub fn account_created(
    account: &Account,
    email: &str,
) -> Result<EventMessage, serde_json::Error> {
    json_message(
        ACCOUNTS_TOPIC_V1,
        account.account_id.to_string(),
        ACCOUNT_CREATED,
        &AccountCreatedPayload {
            id: account.account_id,
            email: email.to_string(),
            role: account.role,
            status: "active".to_string(),
            created_at: account.created_utc,
        },
    )
}

pub fn account_deleted(
    account_id: Uuid,
    deleted_at: DateTime<Utc>,
) -> Result<EventMessage, serde_json::Error> {
    json_message(
        ACCOUNTS_TOPIC_V1,
        account_id.to_string(),
        ACCOUNT_DELETED,
        &AccountDeletedPayload {
            account_id,
            deleted_at,
        },
    )
}

pub fn account_username_updated(account: &Account) -> Result<EventMessage, serde_json::Error> {
    json_message(
        ACCOUNTS_TOPIC_V1,
        account.account_id.to_string(),
        ACCOUNT_USERNAME_UPDATED,
        &AccountUsernameUpdatedPayload {
            account_id: account.account_id,
            new_username: account.username.clone(),
            version: account.version,
            updated_at: account.updated_utc,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_created_is_keyed_by_account() -> Result<(), serde_json::Error> {
        let account = Account::new("alice".to_string(), Role::User, Utc::now());
        let message = account_created(&account, "user@example.com")?;

        assert_eq!(message.topic, ACCOUNTS_TOPIC_V1);
        assert_eq!(message.key, account.account_id.to_string());
        assert_eq!(message.headers.event_type, ACCOUNT_CREATED);
        assert_eq!(message.headers.event_version, 1);
        assert_eq!(message.headers.producer, PRODUCER);
        assert_eq!(message.headers.content_type, CONTENT_TYPE_JSON);

        let json: serde_json::Value = serde_json::from_slice(&message.payload)?;
        assert_eq!(json["status"], "active");
        assert_eq!(json["role"], "user");
        assert_eq!(json["email"], "user@example.com");
        Ok(())
    }

    #[test]
    fn member_created_accepts_optional_fields() -> Result<(), serde_json::Error> {
        let raw = serde_json::json!({
            "member_id": Uuid::new_v4(),
            "account_id": Uuid::new_v4(),
            "organization_id": Uuid::new_v4(),
            "position": "engineer",
            "created_at": "2025-01-01T00:00:00Z"
        });
        let payload: OrgMemberCreatedPayload = serde_json::from_value(raw)?;
        assert_eq!(payload.position.as_deref(), Some("engineer"));
        assert_eq!(payload.label, None);
        Ok(())
    }
}
