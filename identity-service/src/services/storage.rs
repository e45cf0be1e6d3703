//! Storage seam: a unit-of-work transaction exposing every persistence
//! operation the service needs.
//!
//! "Row absent" is reported as `None`/`false`, never as an error. A
//! transaction that is dropped without `commit` is rolled back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Account, AccountEmail, AccountPassword, EntityType, EventBox, EventRecord, EventStatus,
    OrgMember, Organization, Page, Session, Settlement,
};

/// Unique constraint guarding account usernames.
pub const USERNAME_CONSTRAINT: &str = "accounts_username_key";
/// Unique constraint guarding account emails.
pub const EMAIL_CONSTRAINT: &str = "account_emails_email_key";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("storage error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                return StorageError::Conflict(constraint);
            }
        }
        StorageError::Database(err)
    }
}

/// Entry point to a store: hands out transactions.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;
}

#[async_trait]
pub trait Transaction: Send {
    // Accounts

    async fn insert_account(
        &mut self,
        account: &Account,
        email: &AccountEmail,
        password: &AccountPassword,
    ) -> Result<(), StorageError>;

    async fn find_account(&mut self, account_id: Uuid) -> Result<Option<Account>, StorageError>;

    async fn find_account_by_email(&mut self, email: &str)
        -> Result<Option<Account>, StorageError>;

    async fn find_account_by_username(
        &mut self,
        username: &str,
    ) -> Result<Option<Account>, StorageError>;

    async fn email_exists(&mut self, email: &str) -> Result<bool, StorageError>;

    async fn username_exists(&mut self, username: &str) -> Result<bool, StorageError>;

    async fn find_account_email(
        &mut self,
        account_id: Uuid,
    ) -> Result<Option<AccountEmail>, StorageError>;

    async fn find_account_password(
        &mut self,
        account_id: Uuid,
    ) -> Result<Option<AccountPassword>, StorageError>;

    /// Replaces the hash and bumps the password version.
    async fn update_account_password(
        &mut self,
        account_id: Uuid,
        hash_text: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountPassword>, StorageError>;

    /// Renames the account and bumps its version.
    async fn update_account_username(
        &mut self,
        account_id: Uuid,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Account>, StorageError>;

    /// Hard-deletes the account together with its email, password and sessions.
    async fn delete_account(&mut self, account_id: Uuid) -> Result<bool, StorageError>;

    // Sessions

    async fn insert_session(&mut self, session: &Session) -> Result<(), StorageError>;

    async fn find_session(&mut self, session_id: Uuid) -> Result<Option<Session>, StorageError>;

    /// Newest first.
    async fn list_account_sessions(
        &mut self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Session>, StorageError>;

    /// Compare-and-swap of the refresh hash. Returns `None` when the session
    /// is gone or its stored hash is no longer `expected_hash`.
    async fn rotate_session_hash(
        &mut self,
        session_id: Uuid,
        expected_hash: &str,
        new_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StorageError>;

    async fn delete_session(
        &mut self,
        account_id: Uuid,
        session_id: Uuid,
    ) -> Result<bool, StorageError>;

    async fn delete_account_sessions(&mut self, account_id: Uuid) -> Result<u64, StorageError>;

    // Organization projection

    /// Returns `false` when the organization already exists.
    async fn insert_organization(&mut self, organization: &Organization)
        -> Result<bool, StorageError>;

    async fn find_organization(
        &mut self,
        organization_id: Uuid,
    ) -> Result<Option<Organization>, StorageError>;

    async fn delete_organization(&mut self, organization_id: Uuid) -> Result<bool, StorageError>;

    /// Returns `false` when the member already exists.
    async fn insert_org_member(&mut self, member: &OrgMember) -> Result<bool, StorageError>;

    async fn find_org_member(&mut self, member_id: Uuid)
        -> Result<Option<OrgMember>, StorageError>;

    async fn delete_org_member(&mut self, member_id: Uuid) -> Result<bool, StorageError>;

    async fn delete_organization_members(
        &mut self,
        organization_id: Uuid,
    ) -> Result<u64, StorageError>;

    async fn account_has_membership(&mut self, account_id: Uuid) -> Result<bool, StorageError>;

    // Tombstones

    /// Holds a lock on each entity until the transaction ends. Transactions
    /// that tombstone-check and write the same entity must take it first;
    /// keys are acquired in a fixed order regardless of argument order.
    async fn lock_entities(&mut self, entities: &[(EntityType, Uuid)])
        -> Result<(), StorageError>;

    /// Returns `false` when the entity was already buried.
    async fn bury(
        &mut self,
        entity_type: EntityType,
        entity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Buries every current session of the account.
    async fn bury_account_sessions(
        &mut self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    /// Buries every current member of the organization.
    async fn bury_organization_members(
        &mut self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    async fn is_buried(
        &mut self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> Result<bool, StorageError>;

    // Event boxes

    /// Returns `false` when a row with the same event id already exists.
    async fn enqueue_event(
        &mut self,
        event_box: EventBox,
        record: &EventRecord,
    ) -> Result<bool, StorageError>;

    /// Claims up to `limit` due outbox rows for `process_id`, in `seq` order.
    ///
    /// A key is skipped entirely while it has a row in flight or a row
    /// waiting for its retry time, so rows of one key never overtake each
    /// other.
    async fn claim_outbox(
        &mut self,
        process_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StorageError>;

    /// Claims up to `limit` due inbox rows for `process_id`, in `seq` order.
    async fn claim_inbox(
        &mut self,
        process_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StorageError>;

    async fn settle_event(
        &mut self,
        event_box: EventBox,
        event_id: Uuid,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn find_event(
        &mut self,
        event_box: EventBox,
        event_id: Uuid,
    ) -> Result<Option<EventRecord>, StorageError>;

    /// Oldest first.
    async fn list_events(
        &mut self,
        event_box: EventBox,
        status: EventStatus,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StorageError>;

    async fn purge_failed_events(&mut self, event_box: EventBox) -> Result<u64, StorageError>;

    /// Returns rows stuck in `processing` under the given process ids to
    /// `pending`.
    async fn release_processing_events(
        &mut self,
        event_box: EventBox,
        process_ids: &[String],
    ) -> Result<u64, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
