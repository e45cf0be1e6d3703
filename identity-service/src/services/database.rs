//! PostgreSQL implementation of the storage seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use uuid::Uuid;

use crate::models::{
    Account, AccountEmail, AccountPassword, EntityType, EventBox, EventRecord, EventStatus,
    OrgMember, Organization, Page, Session, Settlement,
};
use crate::services::storage::{Storage, StorageError, Transaction};

const ACCOUNT_COLUMNS: &str = "a.account_id, a.username, a.role, a.version, a.created_utc, a.updated_utc";
const EMAIL_COLUMNS: &str = "account_id, email, verified, version, created_utc, updated_utc";
const PASSWORD_COLUMNS: &str = "account_id, hash_text, version, created_utc, updated_utc";
const SESSION_COLUMNS: &str =
    "session_id, account_id, hash_text, version, last_used_utc, created_utc";
const ORGANIZATION_COLUMNS: &str = "organization_id, source_created_utc, replica_created_utc";
const MEMBER_COLUMNS: &str =
    "member_id, account_id, organization_id, position, label, source_created_utc, replica_created_utc";
const EVENT_COLUMNS: &str = "event_id, seq, topic, event_key, event_type, event_version, producer, \
     content_type, payload, status, attempts, next_attempt_utc, processing_id, last_error, \
     created_utc, finished_utc";

/// Advisory lock keys serializing claims per event table.
const OUTBOX_CLAIM_LOCK: i64 = 0x6f75_7462_6f78;
const INBOX_CLAIM_LOCK: i64 = 0x696e_626f_78;

/// Advisory lock key of one entity. A collision between two entities only
/// serializes them.
fn entity_lock_key(entity_type: EntityType, entity_id: Uuid) -> i64 {
    let tag: u64 = match entity_type {
        EntityType::Account => 1,
        EntityType::Session => 2,
        EntityType::OrganizationMember => 3,
        EntityType::Organization => 4,
    };
    let bits = entity_id.as_u128();
    ((bits >> 64) as u64 ^ bits as u64 ^ tag.rotate_right(8)) as i64
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for Database {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        crate::db::health_check(&self.pool).await?;
        Ok(())
    }
}

/// One open Postgres transaction.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn insert_account(
        &mut self,
        account: &Account,
        email: &AccountEmail,
        password: &AccountPassword,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (account_id, username, role, version, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(account.account_id)
        .bind(&account.username)
        .bind(account.role.as_str())
        .bind(account.version)
        .bind(account.created_utc)
        .bind(account.updated_utc)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO account_emails (account_id, email, verified, version, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(email.account_id)
        .bind(&email.email)
        .bind(email.verified)
        .bind(email.version)
        .bind(email.created_utc)
        .bind(email.updated_utc)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO account_passwords (account_id, hash_text, version, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(password.account_id)
        .bind(&password.hash_text)
        .bind(password.version)
        .bind(password.created_utc)
        .bind(password.updated_utc)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn find_account(&mut self, account_id: Uuid) -> Result<Option<Account>, StorageError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts a WHERE a.account_id = $1");
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(account_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(account)
    }

    async fn find_account_by_email(
        &mut self,
        email: &str,
    ) -> Result<Option<Account>, StorageError> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts a \
             JOIN account_emails e ON e.account_id = a.account_id \
             WHERE e.email = $1"
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(email)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(account)
    }

    async fn find_account_by_username(
        &mut self,
        username: &str,
    ) -> Result<Option<Account>, StorageError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts a WHERE a.username = $1");
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(username)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(account)
    }

    async fn email_exists(&mut self, email: &str) -> Result<bool, StorageError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM account_emails WHERE email = $1)",
        )
        .bind(email)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn username_exists(&mut self, username: &str) -> Result<bool, StorageError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM accounts WHERE username = $1)",
        )
        .bind(username)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn find_account_email(
        &mut self,
        account_id: Uuid,
    ) -> Result<Option<AccountEmail>, StorageError> {
        let sql = format!("SELECT {EMAIL_COLUMNS} FROM account_emails WHERE account_id = $1");
        let email = sqlx::query_as::<_, AccountEmail>(&sql)
            .bind(account_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(email)
    }

    async fn find_account_password(
        &mut self,
        account_id: Uuid,
    ) -> Result<Option<AccountPassword>, StorageError> {
        let sql =
            format!("SELECT {PASSWORD_COLUMNS} FROM account_passwords WHERE account_id = $1");
        let password = sqlx::query_as::<_, AccountPassword>(&sql)
            .bind(account_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(password)
    }

    async fn update_account_password(
        &mut self,
        account_id: Uuid,
        hash_text: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccountPassword>, StorageError> {
        let sql = format!(
            "UPDATE account_passwords \
             SET hash_text = $2, version = version + 1, updated_utc = $3 \
             WHERE account_id = $1 \
             RETURNING {PASSWORD_COLUMNS}"
        );
        let password = sqlx::query_as::<_, AccountPassword>(&sql)
            .bind(account_id)
            .bind(hash_text)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(password)
    }

    async fn update_account_username(
        &mut self,
        account_id: Uuid,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Account>, StorageError> {
        let sql = format!(
            "UPDATE accounts a \
             SET username = $2, version = version + 1, updated_utc = $3 \
             WHERE a.account_id = $1 \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(account_id)
            .bind(username)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(account)
    }

    async fn delete_account(&mut self, account_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM accounts WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_session(&mut self, session: &Session) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, account_id, hash_text, version, last_used_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(session.session_id)
        .bind(session.account_id)
        .bind(&session.hash_text)
        .bind(session.version)
        .bind(session.last_used_utc)
        .bind(session.created_utc)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_session(&mut self, session_id: Uuid) -> Result<Option<Session>, StorageError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1");
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(session_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(session)
    }

    async fn list_account_sessions(
        &mut self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Session>, StorageError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE account_id = $1 \
             ORDER BY created_utc DESC, session_id \
             LIMIT $2 OFFSET $3"
        );
        let data = sqlx::query_as::<_, Session>(&sql)
            .bind(account_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *self.tx)
            .await?;

        let total =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions WHERE account_id = $1")
                .bind(account_id)
                .fetch_one(&mut *self.tx)
                .await?;

        Ok(Page { data, total })
    }

    async fn rotate_session_hash(
        &mut self,
        session_id: Uuid,
        expected_hash: &str,
        new_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, StorageError> {
        let sql = format!(
            "UPDATE sessions \
             SET hash_text = $3, version = version + 1, last_used_utc = $4 \
             WHERE session_id = $1 AND hash_text = $2 \
             RETURNING {SESSION_COLUMNS}"
        );
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(session_id)
            .bind(expected_hash)
            .bind(new_hash)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(session)
    }

    async fn delete_session(
        &mut self,
        account_id: Uuid,
        session_id: Uuid,
    ) -> Result<bool, StorageError> {
        let result =
            sqlx::query("DELETE FROM sessions WHERE account_id = $1 AND session_id = $2")
                .bind(account_id)
                .bind(session_id)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_account_sessions(&mut self, account_id: Uuid) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM sessions WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_organization(
        &mut self,
        organization: &Organization,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO organizations (organization_id, source_created_utc, replica_created_utc)
            VALUES ($1, $2, $3)
            ON CONFLICT (organization_id) DO NOTHING
            "#,
        )
        .bind(organization.organization_id)
        .bind(organization.source_created_utc)
        .bind(organization.replica_created_utc)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_organization(
        &mut self,
        organization_id: Uuid,
    ) -> Result<Option<Organization>, StorageError> {
        let sql =
            format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE organization_id = $1");
        let organization = sqlx::query_as::<_, Organization>(&sql)
            .bind(organization_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(organization)
    }

    async fn delete_organization(&mut self, organization_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM organizations WHERE organization_id = $1")
            .bind(organization_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_org_member(&mut self, member: &OrgMember) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO organization_members
                (member_id, account_id, organization_id, position, label,
                 source_created_utc, replica_created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (member_id) DO NOTHING
            "#,
        )
        .bind(member.member_id)
        .bind(member.account_id)
        .bind(member.organization_id)
        .bind(&member.position)
        .bind(&member.label)
        .bind(member.source_created_utc)
        .bind(member.replica_created_utc)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_org_member(
        &mut self,
        member_id: Uuid,
    ) -> Result<Option<OrgMember>, StorageError> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM organization_members WHERE member_id = $1");
        let member = sqlx::query_as::<_, OrgMember>(&sql)
            .bind(member_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(member)
    }

    async fn delete_org_member(&mut self, member_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM organization_members WHERE member_id = $1")
            .bind(member_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_organization_members(
        &mut self,
        organization_id: Uuid,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM organization_members WHERE organization_id = $1")
            .bind(organization_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn account_has_membership(&mut self, account_id: Uuid) -> Result<bool, StorageError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM organization_members WHERE account_id = $1)",
        )
        .bind(account_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn lock_entities(
        &mut self,
        entities: &[(EntityType, Uuid)],
    ) -> Result<(), StorageError> {
        let mut keys: Vec<i64> = entities
            .iter()
            .map(|(entity_type, entity_id)| entity_lock_key(*entity_type, *entity_id))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        for key in keys {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(key)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }

    async fn bury(
        &mut self,
        entity_type: EntityType,
        entity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tombstones (tombstone_id, entity_type, entity_id, deleted_utc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entity_type, entity_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bury_account_sessions(
        &mut self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tombstones (tombstone_id, entity_type, entity_id, deleted_utc)
            SELECT gen_random_uuid(), $2, session_id, $3
            FROM sessions
            WHERE account_id = $1
            ON CONFLICT (entity_type, entity_id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(EntityType::Session.as_str())
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn bury_organization_members(
        &mut self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tombstones (tombstone_id, entity_type, entity_id, deleted_utc)
            SELECT gen_random_uuid(), $2, member_id, $3
            FROM organization_members
            WHERE organization_id = $1
            ON CONFLICT (entity_type, entity_id) DO NOTHING
            "#,
        )
        .bind(organization_id)
        .bind(EntityType::OrganizationMember.as_str())
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn is_buried(
        &mut self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> Result<bool, StorageError> {
        let buried = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM tombstones WHERE entity_type = $1 AND entity_id = $2)",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(buried)
    }

    async fn enqueue_event(
        &mut self,
        event_box: EventBox,
        record: &EventRecord,
    ) -> Result<bool, StorageError> {
        let sql = format!(
            "INSERT INTO {} \
                (event_id, topic, event_key, event_type, event_version, producer, content_type, \
                 payload, status, attempts, next_attempt_utc, created_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (event_id) DO NOTHING",
            event_box.table()
        );
        let result = sqlx::query(&sql)
            .bind(record.event_id)
            .bind(&record.topic)
            .bind(&record.event_key)
            .bind(&record.event_type)
            .bind(record.event_version)
            .bind(&record.producer)
            .bind(&record.content_type)
            .bind(&record.payload)
            .bind(record.status.as_str())
            .bind(record.attempts)
            .bind(record.next_attempt_utc)
            .bind(record.created_utc)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_outbox(
        &mut self,
        process_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StorageError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(OUTBOX_CLAIM_LOCK)
            .execute(&mut *self.tx)
            .await?;

        let sql = format!(
            "WITH blocked AS ( \
                 SELECT DISTINCT event_key FROM outbox_events \
                 WHERE status = 'processing' \
                    OR (status = 'pending' AND next_attempt_utc > $3) \
             ), \
             picked AS ( \
                 SELECT event_id FROM outbox_events \
                 WHERE status = 'pending' \
                   AND next_attempt_utc <= $3 \
                   AND event_key NOT IN (SELECT event_key FROM blocked) \
                 ORDER BY seq \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE outbox_events o \
             SET status = 'processing', processing_id = $1 \
             FROM picked \
             WHERE o.event_id = picked.event_id \
             RETURNING {}",
            prefixed_event_columns("o")
        );
        let mut records = sqlx::query_as::<_, EventRecord>(&sql)
            .bind(process_id)
            .bind(limit)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await?;

        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    async fn claim_inbox(
        &mut self,
        process_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StorageError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(INBOX_CLAIM_LOCK)
            .execute(&mut *self.tx)
            .await?;

        let sql = format!(
            "WITH picked AS ( \
                 SELECT event_id FROM inbox_events \
                 WHERE status = 'pending' AND next_attempt_utc <= $3 \
                 ORDER BY seq \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE inbox_events i \
             SET status = 'processing', processing_id = $1 \
             FROM picked \
             WHERE i.event_id = picked.event_id \
             RETURNING {}",
            prefixed_event_columns("i")
        );
        let mut records = sqlx::query_as::<_, EventRecord>(&sql)
            .bind(process_id)
            .bind(limit)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await?;

        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    async fn settle_event(
        &mut self,
        event_box: EventBox,
        event_id: Uuid,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let table = event_box.table();
        match settlement {
            Settlement::Done => {
                let sql = format!(
                    "UPDATE {table} \
                     SET status = 'done', processing_id = NULL, last_error = NULL, finished_utc = $2 \
                     WHERE event_id = $1"
                );
                sqlx::query(&sql)
                    .bind(event_id)
                    .bind(now)
                    .execute(&mut *self.tx)
                    .await?;
            }
            Settlement::Retry {
                next_attempt_utc,
                error,
            } => {
                let sql = format!(
                    "UPDATE {table} \
                     SET status = 'pending', attempts = attempts + 1, next_attempt_utc = $2, \
                         processing_id = NULL, last_error = $3 \
                     WHERE event_id = $1"
                );
                sqlx::query(&sql)
                    .bind(event_id)
                    .bind(next_attempt_utc)
                    .bind(error)
                    .execute(&mut *self.tx)
                    .await?;
            }
            Settlement::Park { error } => {
                let sql = format!(
                    "UPDATE {table} \
                     SET status = 'failed', attempts = attempts + 1, processing_id = NULL, \
                         last_error = $2, finished_utc = $3 \
                     WHERE event_id = $1"
                );
                sqlx::query(&sql)
                    .bind(event_id)
                    .bind(error)
                    .bind(now)
                    .execute(&mut *self.tx)
                    .await?;
            }
            Settlement::Release => {
                let sql = format!(
                    "UPDATE {table} \
                     SET status = 'pending', processing_id = NULL \
                     WHERE event_id = $1 AND status = 'processing'"
                );
                sqlx::query(&sql)
                    .bind(event_id)
                    .execute(&mut *self.tx)
                    .await?;
            }
        }
        Ok(())
    }

    async fn find_event(
        &mut self,
        event_box: EventBox,
        event_id: Uuid,
    ) -> Result<Option<EventRecord>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM {} WHERE event_id = $1",
            event_box.table()
        );
        let record = sqlx::query_as::<_, EventRecord>(&sql)
            .bind(event_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(record)
    }

    async fn list_events(
        &mut self,
        event_box: EventBox,
        status: EventStatus,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM {} WHERE status = $1 ORDER BY seq LIMIT $2",
            event_box.table()
        );
        let records = sqlx::query_as::<_, EventRecord>(&sql)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(records)
    }

    async fn purge_failed_events(&mut self, event_box: EventBox) -> Result<u64, StorageError> {
        let sql = format!("DELETE FROM {} WHERE status = 'failed'", event_box.table());
        let result = sqlx::query(&sql).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn release_processing_events(
        &mut self,
        event_box: EventBox,
        process_ids: &[String],
    ) -> Result<u64, StorageError> {
        let sql = format!(
            "UPDATE {} SET status = 'pending', processing_id = NULL \
             WHERE status = 'processing' AND processing_id = ANY($1)",
            event_box.table()
        );
        let result = sqlx::query(&sql)
            .bind(process_ids)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn prefixed_event_columns(alias: &str) -> String {
    EVENT_COLUMNS
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_every_event_column() {
        let columns = prefixed_event_columns("o");
        assert!(columns.starts_with("o.event_id, o.seq"));
        assert!(columns.ends_with("o.finished_utc"));
        assert_eq!(columns.matches("o.").count(), 16);
    }

    #[test]
    fn entity_lock_keys_are_stable_and_typed() {
        let id = Uuid::new_v4();
        assert_eq!(
            entity_lock_key(EntityType::Account, id),
            entity_lock_key(EntityType::Account, id)
        );
        assert_ne!(
            entity_lock_key(EntityType::Account, id),
            entity_lock_key(EntityType::OrganizationMember, id)
        );
        assert_ne!(
            entity_lock_key(EntityType::Account, id),
            entity_lock_key(EntityType::Account, Uuid::new_v4())
        );
    }
}
