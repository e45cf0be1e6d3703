//! In-memory implementation of the storage seam.
//!
//! Transactions are serialized: `begin` takes the store lock and works on a
//! copy of the state, which replaces the shared state on `commit`. Backs the
//! test suite and database-less local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::models::{
    Account, AccountEmail, AccountPassword, EntityType, EventBox, EventRecord, EventStatus,
    OrgMember, Organization, Page, Session, Settlement, Tombstone,
};
use crate::services::storage::{
    Storage, StorageError, Transaction, EMAIL_CONSTRAINT, USERNAME_CONSTRAINT,
};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    emails: HashMap<Uuid, AccountEmail>,
    passwords: HashMap<Uuid, AccountPassword>,
    sessions: HashMap<Uuid, Session>,
    organizations: HashMap<Uuid, Organization>,
    members: HashMap<Uuid, OrgMember>,
    tombstones: HashMap<(EntityType, Uuid), Tombstone>,
    outbox: BTreeMap<i64, EventRecord>,
    inbox: BTreeMap<i64, EventRecord>,
    seq: i64,
}

impl MemoryState {
    fn events(&self, event_box: EventBox) -> &BTreeMap<i64, EventRecord> {
        match event_box {
            EventBox::Outbox => &self.outbox,
            EventBox::Inbox => &self.inbox,
        }
    }

    fn events_mut(&mut self, event_box: EventBox) -> &mut BTreeMap<i64, EventRecord> {
        match event_box {
            EventBox::Outbox => &mut self.outbox,
            EventBox::Inbox => &mut self.inbox,
        }
    }
}

/// Shared in-memory store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    failing_commits: Arc<AtomicUsize>,
    failing_operations: FailingOperations,
}

/// Remaining injected failures per transaction operation name.
type FailingOperations = Arc<StdMutex<HashMap<&'static str, usize>>>;

/// Consumes one injected failure of `operation`, if any is left.
fn injected_failure(
    failing: &FailingOperations,
    operation: &'static str,
) -> Result<(), StorageError> {
    let Ok(mut remaining) = failing.lock() else {
        return Ok(());
    };
    match remaining.get_mut(operation) {
        Some(count) if *count > 0 => {
            *count -= 1;
            Err(StorageError::Internal(format!("{} failed", operation)))
        }
        _ => Ok(()),
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail, discarding their changes.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` calls of a projection write fail inside their
    /// transaction: `insert_org_member`, `insert_organization` or `bury`.
    pub fn fail_operation(&self, operation: &'static str, count: usize) {
        if let Ok(mut remaining) = self.failing_operations.lock() {
            remaining.insert(operation, count);
        }
    }

    /// All tombstones, for inspection.
    pub async fn tombstones(&self) -> Vec<Tombstone> {
        let state = self.state.lock().await;
        state.tombstones.values().cloned().collect()
    }

    /// All rows of an event table in `seq` order, for inspection.
    pub async fn events(&self, event_box: EventBox) -> Vec<EventRecord> {
        let state = self.state.lock().await;
        state.events(event_box).values().cloned().collect()
    }

    pub async fn account_count(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            failing_commits: self.failing_commits.clone(),
            failing_operations: self.failing_operations.clone(),
        }))
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    failing_commits: Arc<AtomicUsize>,
    failing_operations: FailingOperations,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn insert_account(
        &mut self,
        account: &Account,
        email: &AccountEmail,
        password: &AccountPassword,
    ) -> Result<(), StorageError> {
        let state = &mut self.working;
        if state.accounts.values().any(|a| a.username == account.username) {
            return Err(StorageError::Conflict(USERNAME_CONSTRAINT.to_string()));
        }
        if state.emails.values().any(|e| e.email == email.email) {
            return Err(StorageError::Conflict(EMAIL_CONSTRAINT.to_string()));
        }
        if state.accounts.contains_key(&account.account_id) {
            return Err(StorageError::Conflict("accounts_pkey".to_string()));
        }

        state.accounts.insert(account.account_id, account.clone());
        state.emails.insert(email.account_id, email.clone());
        state.passwords.insert(password.account_id, password.clone());
        Ok(())
    }

    async fn find_account(&mut self, account_id: Uuid) -> Result<Option<Account>, StorageError> {
        Ok(self.working.accounts.get(&account_id).cloned())
    }

    async fn find_account_by_email(
        &mut self,
        email: &str,
    ) -> Result<Option<Account>, StorageError> {
        let state = &self.working;
        Ok(state
            .emails
            .values()
            .find(|e| e.email == email)
            .and_then(|e| state.accounts.get(&e.account_id))
            .cloned())
    }

    async fn find_account_by_username(
        &mut self,
        username: &str,
    ) -> Result<Option<Account>, StorageError> {
        Ok(self
            .working
            .accounts
            .values()
            .find(|a| a.username == username)
            .cloned())
    }

    async fn email_exists(&mut self, email: &str) -> Result<bool, StorageError> {
        Ok(self.working.emails.values().any(|e| e.email == email))
    }

    async fn username_exists(&mut self, username: &str) -> Result<bool, StorageError> {
        Ok(self.working.accounts.values().any(|a| a.username == username))
    }

    async fn find_account_email(
        &mut self,
        account_id: Uuid,
    ) -> Result<Option<AccountEmail>, StorageError> {
        Ok(self.working.emails.get(&account_id).cloned())
    }

    async fn find_account_password(
        &mut self,
        account_id: Uuid,
    ) -> Result<Option<AccountPassword>, StorageError> {
        Ok(self.working.passwords.get(&account_id).cloned())
    }

    async fn update_account_password(
        &mut self,
        account_id: Uuid,
        hash_text: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountPassword>, StorageError> {
        Ok(self.working.passwords.get_mut(&account_id).map(|p| {
            p.hash_text = hash_text.to_string();
            p.version += 1;
            p.updated_utc = now;
            p.clone()
        }))
    }

    async fn update_account_username(
        &mut self,
        account_id: Uuid,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Account>, StorageError> {
        let taken = self
            .working
            .accounts
            .values()
            .any(|a| a.username == username && a.account_id != account_id);
        if taken {
            return Err(StorageError::Conflict(USERNAME_CONSTRAINT.to_string()));
        }

        Ok(self.working.accounts.get_mut(&account_id).map(|a| {
            a.username = username.to_string();
            a.version += 1;
            a.updated_utc = now;
            a.clone()
        }))
    }

    async fn delete_account(&mut self, account_id: Uuid) -> Result<bool, StorageError> {
        let state = &mut self.working;
        let existed = state.accounts.remove(&account_id).is_some();
        state.emails.remove(&account_id);
        state.passwords.remove(&account_id);
        state.sessions.retain(|_, s| s.account_id != account_id);
        Ok(existed)
    }

    async fn insert_session(&mut self, session: &Session) -> Result<(), StorageError> {
        if !self.working.accounts.contains_key(&session.account_id) {
            return Err(StorageError::Internal(format!(
                "session {} references missing account {}",
                session.session_id, session.account_id
            )));
        }
        if self.working.sessions.contains_key(&session.session_id) {
            return Err(StorageError::Conflict("sessions_pkey".to_string()));
        }
        self.working
            .sessions
            .insert(session.session_id, session.clone());
        Ok(())
    }

    async fn find_session(&mut self, session_id: Uuid) -> Result<Option<Session>, StorageError> {
        Ok(self.working.sessions.get(&session_id).cloned())
    }

    async fn list_account_sessions(
        &mut self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Session>, StorageError> {
        let mut sessions: Vec<Session> = self
            .working
            .sessions
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            b.created_utc
                .cmp(&a.created_utc)
                .then(a.session_id.cmp(&b.session_id))
        });

        let total = sessions.len() as i64;
        let data = sessions
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(Page { data, total })
    }

    async fn rotate_session_hash(
        &mut self,
        session_id: Uuid,
        expected_hash: &str,
        new_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StorageError> {
        Ok(self
            .working
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.hash_text == expected_hash)
            .map(|s| {
                s.hash_text = new_hash.to_string();
                s.version += 1;
                s.last_used_utc = now;
                s.clone()
            }))
    }

    async fn delete_session(
        &mut self,
        account_id: Uuid,
        session_id: Uuid,
    ) -> Result<bool, StorageError> {
        let owned = self
            .working
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.account_id == account_id);
        if owned {
            self.working.sessions.remove(&session_id);
        }
        Ok(owned)
    }

    async fn delete_account_sessions(&mut self, account_id: Uuid) -> Result<u64, StorageError> {
        let before = self.working.sessions.len();
        self.working
            .sessions
            .retain(|_, s| s.account_id != account_id);
        Ok((before - self.working.sessions.len()) as u64)
    }

    async fn insert_organization(
        &mut self,
        organization: &Organization,
    ) -> Result<bool, StorageError> {
        injected_failure(&self.failing_operations, "insert_organization")?;
        if self
            .working
            .organizations
            .contains_key(&organization.organization_id)
        {
            return Ok(false);
        }
        self.working
            .organizations
            .insert(organization.organization_id, organization.clone());
        Ok(true)
    }

    async fn find_organization(
        &mut self,
        organization_id: Uuid,
    ) -> Result<Option<Organization>, StorageError> {
        Ok(self.working.organizations.get(&organization_id).cloned())
    }

    async fn delete_organization(&mut self, organization_id: Uuid) -> Result<bool, StorageError> {
        Ok(self.working.organizations.remove(&organization_id).is_some())
    }

    async fn insert_org_member(&mut self, member: &OrgMember) -> Result<bool, StorageError> {
        injected_failure(&self.failing_operations, "insert_org_member")?;
        if self.working.members.contains_key(&member.member_id) {
            return Ok(false);
        }
        self.working.members.insert(member.member_id, member.clone());
        Ok(true)
    }

    async fn find_org_member(
        &mut self,
        member_id: Uuid,
    ) -> Result<Option<OrgMember>, StorageError> {
        Ok(self.working.members.get(&member_id).cloned())
    }

    async fn delete_org_member(&mut self, member_id: Uuid) -> Result<bool, StorageError> {
        Ok(self.working.members.remove(&member_id).is_some())
    }

    async fn delete_organization_members(
        &mut self,
        organization_id: Uuid,
    ) -> Result<u64, StorageError> {
        let before = self.working.members.len();
        self.working
            .members
            .retain(|_, m| m.organization_id != organization_id);
        Ok((before - self.working.members.len()) as u64)
    }

    async fn account_has_membership(&mut self, account_id: Uuid) -> Result<bool, StorageError> {
        Ok(self
            .working
            .members
            .values()
            .any(|m| m.account_id == account_id))
    }

    async fn lock_entities(
        &mut self,
        _entities: &[(EntityType, Uuid)],
    ) -> Result<(), StorageError> {
        // The store lock held since `begin` already excludes everyone else.
        Ok(())
    }

    async fn bury(
        &mut self,
        entity_type: EntityType,
        entity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        injected_failure(&self.failing_operations, "bury")?;
        let key = (entity_type, entity_id);
        if self.working.tombstones.contains_key(&key) {
            return Ok(false);
        }
        self.working
            .tombstones
            .insert(key, Tombstone::new(entity_type, entity_id, now));
        Ok(true)
    }

    async fn bury_account_sessions(
        &mut self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let session_ids: Vec<Uuid> = self
            .working
            .sessions
            .values()
            .filter(|s| s.account_id == account_id)
            .map(|s| s.session_id)
            .collect();

        let mut buried = 0;
        for session_id in session_ids {
            if self.bury(EntityType::Session, session_id, now).await? {
                buried += 1;
            }
        }
        Ok(buried)
    }

    async fn bury_organization_members(
        &mut self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let member_ids: Vec<Uuid> = self
            .working
            .members
            .values()
            .filter(|m| m.organization_id == organization_id)
            .map(|m| m.member_id)
            .collect();

        let mut buried = 0;
        for member_id in member_ids {
            if self
                .bury(EntityType::OrganizationMember, member_id, now)
                .await?
            {
                buried += 1;
            }
        }
        Ok(buried)
    }

    async fn is_buried(
        &mut self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> Result<bool, StorageError> {
        Ok(self
            .working
            .tombstones
            .contains_key(&(entity_type, entity_id)))
    }

    async fn enqueue_event(
        &mut self,
        event_box: EventBox,
        record: &EventRecord,
    ) -> Result<bool, StorageError> {
        let exists = self
            .working
            .events(event_box)
            .values()
            .any(|r| r.event_id == record.event_id);
        if exists {
            return Ok(false);
        }

        self.working.seq += 1;
        let seq = self.working.seq;
        let mut record = record.clone();
        record.seq = seq;
        self.working.events_mut(event_box).insert(seq, record);
        Ok(true)
    }

    async fn claim_outbox(
        &mut self,
        process_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let outbox = &mut self.working.outbox;
        let blocked: HashSet<String> = outbox
            .values()
            .filter(|r| {
                r.status == EventStatus::Processing
                    || (r.status == EventStatus::Pending && r.next_attempt_utc > now)
            })
            .map(|r| r.event_key.clone())
            .collect();

        let mut claimed = Vec::new();
        for record in outbox.values_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if record.status == EventStatus::Pending
                && record.next_attempt_utc <= now
                && !blocked.contains(&record.event_key)
            {
                record.status = EventStatus::Processing;
                record.processing_id = Some(process_id.to_string());
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_inbox(
        &mut self,
        process_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let mut claimed = Vec::new();
        for record in self.working.inbox.values_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if record.status == EventStatus::Pending && record.next_attempt_utc <= now {
                record.status = EventStatus::Processing;
                record.processing_id = Some(process_id.to_string());
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn settle_event(
        &mut self,
        event_box: EventBox,
        event_id: Uuid,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let Some(record) = self
            .working
            .events_mut(event_box)
            .values_mut()
            .find(|r| r.event_id == event_id)
        else {
            return Ok(());
        };

        match settlement {
            Settlement::Done => {
                record.status = EventStatus::Done;
                record.processing_id = None;
                record.last_error = None;
                record.finished_utc = Some(now);
            }
            Settlement::Retry {
                next_attempt_utc,
                error,
            } => {
                record.status = EventStatus::Pending;
                record.attempts += 1;
                record.next_attempt_utc = *next_attempt_utc;
                record.processing_id = None;
                record.last_error = Some(error.clone());
            }
            Settlement::Park { error } => {
                record.status = EventStatus::Failed;
                record.attempts += 1;
                record.processing_id = None;
                record.last_error = Some(error.clone());
                record.finished_utc = Some(now);
            }
            Settlement::Release => {
                if record.status == EventStatus::Processing {
                    record.status = EventStatus::Pending;
                    record.processing_id = None;
                }
            }
        }
        Ok(())
    }

    async fn find_event(
        &mut self,
        event_box: EventBox,
        event_id: Uuid,
    ) -> Result<Option<EventRecord>, StorageError> {
        Ok(self
            .working
            .events(event_box)
            .values()
            .find(|r| r.event_id == event_id)
            .cloned())
    }

    async fn list_events(
        &mut self,
        event_box: EventBox,
        status: EventStatus,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        Ok(self
            .working
            .events(event_box)
            .values()
            .filter(|r| r.status == status)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn purge_failed_events(&mut self, event_box: EventBox) -> Result<u64, StorageError> {
        let events = self.working.events_mut(event_box);
        let before = events.len();
        events.retain(|_, r| r.status != EventStatus::Failed);
        Ok((before - events.len()) as u64)
    }

    async fn release_processing_events(
        &mut self,
        event_box: EventBox,
        process_ids: &[String],
    ) -> Result<u64, StorageError> {
        let mut released = 0;
        for record in self.working.events_mut(event_box).values_mut() {
            let owned = record
                .processing_id
                .as_ref()
                .is_some_and(|id| process_ids.contains(id));
            if record.status == EventStatus::Processing && owned {
                record.status = EventStatus::Pending;
                record.processing_id = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let this = *self;
        let failing = this
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Internal("commit failed".to_string()));
        }

        let MemoryTransaction {
            mut guard, working, ..
        } = this;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
