//! Session authority: registration, login, refresh rotation and the
//! account/session lifecycle of an authenticated caller.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    config::AccountConfig,
    models::{
        Account, AccountActor, AccountEmail, AccountPassword, EntityType, EventBox, EventMessage,
        EventRecord, Page, Role, Session, UnsupportedRole,
    },
    services::{
        events,
        jwt::{hashes_match, TokenSigner},
        storage::{Storage, Transaction},
        PolicyService, ServiceError,
    },
    utils::{hash_password, verify_password, Password, PasswordHashString},
};

pub const DEFAULT_SESSIONS_LIMIT: i64 = 20;
pub const MAX_SESSIONS_LIMIT: i64 = 100;

/// Token pair handed out on login and refresh.
#[derive(Debug, Clone)]
pub struct TokensPair {
    pub session_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct RegisterParams {
    pub email: String,
    pub username: String,
    pub password: String,
    pub role: String,
}

#[derive(Clone)]
pub struct AuthService {
    storage: Arc<dyn Storage>,
    signer: Arc<dyn TokenSigner>,
    config: AccountConfig,
}

impl AuthService {
    pub fn new(
        storage: Arc<dyn Storage>,
        signer: Arc<dyn TokenSigner>,
        config: AccountConfig,
    ) -> Self {
        Self {
            storage,
            signer,
            config,
        }
    }

    pub async fn register(
        &self,
        params: RegisterParams,
    ) -> Result<(Account, AccountEmail), ServiceError> {
        let email = PolicyService::normalize_email(&params.email);
        let role: Role = params
            .role
            .parse()
            .map_err(|e: UnsupportedRole| ServiceError::RoleNotSupported(e.0))?;
        PolicyService::validate_username(&params.username)
            .map_err(|e| ServiceError::UsernameNotAllowed(e.to_string()))?;
        PolicyService::validate_password(&params.password)
            .map_err(|e| ServiceError::PasswordNotAllowed(e.to_string()))?;

        let mut tx = self.storage.begin().await?;

        if tx.email_exists(&email).await? {
            return Err(ServiceError::EmailAlreadyExists);
        }
        if tx.username_exists(&params.username).await? {
            return Err(ServiceError::UsernameTaken);
        }
        tx.rollback().await?;

        let password_hash = hash_password(&Password::new(params.password)).map_err(|e| {
            ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e))
        })?;

        let now = Utc::now();
        let account = Account::new(params.username, role, now);
        let account_email = AccountEmail::new(account.account_id, email, false, now);
        let account_password =
            AccountPassword::new(account.account_id, password_hash.into_string(), now);

        let mut tx = self.storage.begin().await?;
        tx.insert_account(&account, &account_email, &account_password)
            .await
            .map_err(ServiceError::from_storage_conflict)?;
        let message = events::account_created(&account, &account_email.email)
            .map_err(anyhow::Error::from)?;
        enqueue_outbox(tx.as_mut(), message).await?;
        tx.commit()
            .await
            .map_err(ServiceError::from_storage_conflict)?;

        tracing::info!(account_id = %account.account_id, role = %account.role, "Account registered");

        Ok((account, account_email))
    }

    /// Registration on behalf of an administrator.
    pub async fn register_by_admin(
        &self,
        initiator: &AccountActor,
        params: RegisterParams,
    ) -> Result<(Account, AccountEmail), ServiceError> {
        let mut tx = self.storage.begin().await?;
        let (account, _) = validate_actor(tx.as_mut(), initiator).await?;
        tx.rollback().await?;

        if !account.is_admin() {
            tracing::warn!(account_id = %account.account_id, "Non-admin attempted admin registration");
            return Err(ServiceError::NotEnoughRights);
        }

        self.register(params).await
    }

    pub async fn login_by_email(
        &self,
        email: &str,
        password: &str,
    ) -> Result<TokensPair, ServiceError> {
        let email = PolicyService::normalize_email(email);

        let mut tx = self.storage.begin().await?;
        let account = tx
            .find_account_by_email(&email)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        let stored = tx
            .find_account_password(account.account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        tx.rollback().await?;

        check_password(password, &stored)?;
        self.create_session(&account).await
    }

    pub async fn login_by_username(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokensPair, ServiceError> {
        let mut tx = self.storage.begin().await?;
        let account = tx
            .find_account_by_username(username)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        let stored = tx
            .find_account_password(account.account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        tx.rollback().await?;

        check_password(password, &stored)?;
        self.create_session(&account).await
    }

    /// Login for an email already proven by the Google code exchange.
    pub async fn login_by_google(&self, email: &str) -> Result<TokensPair, ServiceError> {
        let email = PolicyService::normalize_email(email);

        let mut tx = self.storage.begin().await?;
        let account = tx
            .find_account_by_email(&email)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        tx.rollback().await?;

        self.create_session(&account).await
    }

    async fn create_session(&self, account: &Account) -> Result<TokensPair, ServiceError> {
        let session_id = Uuid::new_v4();
        let tokens = self.mint_tokens(account, session_id)?;
        let session = Session::new(
            session_id,
            account.account_id,
            self.signer.hash_refresh(&tokens.refresh_token),
            Utc::now(),
        );

        let mut tx = self.storage.begin().await?;
        if tx.find_account(account.account_id).await?.is_none() {
            return Err(ServiceError::AccountNotFound);
        }
        tx.insert_session(&session).await?;
        tx.commit().await?;

        tracing::info!(account_id = %account.account_id, session_id = %session_id, "Session created");

        Ok(tokens)
    }

    fn mint_tokens(&self, account: &Account, session_id: Uuid) -> Result<TokensPair, ServiceError> {
        Ok(TokensPair {
            session_id,
            access_token: self.signer.generate_access(account, session_id)?,
            refresh_token: self.signer.generate_refresh(account, session_id)?,
            expires_in: self.signer.access_token_ttl().num_seconds(),
        })
    }

    /// Rotates the refresh token of a session. A token that was already
    /// rotated away no longer matches the stored hash and is rejected.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokensPair, ServiceError> {
        let claims = self.signer.parse_refresh(refresh_token).map_err(|e| {
            tracing::debug!(error = %e, "Refresh token rejected");
            ServiceError::InvalidToken
        })?;

        let mut tx = self.storage.begin().await?;

        let account = tx
            .find_account(claims.sub)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;

        let session = tx
            .find_session(claims.sid)
            .await?
            .filter(|s| s.account_id == account.account_id)
            .ok_or(ServiceError::SessionNotFound)?;

        let presented = self.signer.hash_refresh(refresh_token);
        if !hashes_match(&session.hash_text, &presented) {
            tracing::warn!(
                account_id = %account.account_id,
                session_id = %session.session_id,
                "Refresh token does not match the current session token"
            );
            if self.config.revoke_session_on_token_mismatch {
                tx.delete_session(account.account_id, session.session_id)
                    .await?;
                tx.commit().await?;
                tracing::warn!(session_id = %session.session_id, "Session revoked after token mismatch");
            }
            return Err(ServiceError::SessionTokenMismatch);
        }

        let tokens = self.mint_tokens(&account, session.session_id)?;
        let new_hash = self.signer.hash_refresh(&tokens.refresh_token);

        // A concurrent refresh that already swapped the hash wins.
        if tx
            .rotate_session_hash(session.session_id, &session.hash_text, &new_hash, Utc::now())
            .await?
            .is_none()
        {
            tracing::warn!(session_id = %session.session_id, "Refresh lost rotation race");
            return Err(ServiceError::SessionTokenMismatch);
        }
        tx.commit().await?;

        tracing::debug!(session_id = %session.session_id, "Session refreshed");

        Ok(tokens)
    }

    /// Changes the password and logs out every session of the account.
    pub async fn update_password(
        &self,
        actor: &AccountActor,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), ServiceError> {
        let cooldown = self.config.password_change_cooldown();

        let mut tx = self.storage.begin().await?;
        validate_actor(tx.as_mut(), actor).await?;
        let stored = tx
            .find_account_password(actor.account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        tx.rollback().await?;

        if !stored.can_change(Utc::now(), cooldown) {
            return Err(ServiceError::CannotChangePasswordYet {
                next_change_at: stored.next_change_at(cooldown),
            });
        }

        check_password(old_password, &stored)?;
        PolicyService::validate_password(new_password)
            .map_err(|e| ServiceError::PasswordNotAllowed(e.to_string()))?;

        let new_hash = hash_password(&Password::new(new_password.to_string())).map_err(|e| {
            ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e))
        })?;

        let mut tx = self.storage.begin().await?;
        validate_actor(tx.as_mut(), actor).await?;

        // Another change may have landed while the hashes were computed.
        let current = tx
            .find_account_password(actor.account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        if current.version != stored.version {
            return Err(ServiceError::CannotChangePasswordYet {
                next_change_at: current.next_change_at(cooldown),
            });
        }

        let now = Utc::now();
        tx.update_account_password(actor.account_id, new_hash.as_str(), now)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        let revoked = tx.delete_account_sessions(actor.account_id).await?;
        tx.commit().await?;

        tracing::info!(
            account_id = %actor.account_id,
            revoked_sessions = revoked,
            "Password changed, all sessions revoked"
        );

        Ok(())
    }

    pub async fn update_username(
        &self,
        actor: &AccountActor,
        new_username: &str,
    ) -> Result<Account, ServiceError> {
        PolicyService::validate_username(new_username)
            .map_err(|e| ServiceError::UsernameNotAllowed(e.to_string()))?;

        let mut tx = self.storage.begin().await?;
        let (account, _) = validate_actor(tx.as_mut(), actor).await?;

        if account.username == new_username {
            tx.rollback().await?;
            return Ok(account);
        }
        if tx.username_exists(new_username).await? {
            return Err(ServiceError::UsernameTaken);
        }

        let updated = tx
            .update_account_username(actor.account_id, new_username, Utc::now())
            .await
            .map_err(ServiceError::from_storage_conflict)?
            .ok_or(ServiceError::AccountNotFound)?;
        let message = events::account_username_updated(&updated).map_err(anyhow::Error::from)?;
        enqueue_outbox(tx.as_mut(), message).await?;
        tx.commit()
            .await
            .map_err(ServiceError::from_storage_conflict)?;

        tracing::info!(account_id = %updated.account_id, version = updated.version, "Username updated");

        Ok(updated)
    }

    /// Ends the caller's own session.
    pub async fn logout(&self, actor: &AccountActor) -> Result<(), ServiceError> {
        let mut tx = self.storage.begin().await?;
        validate_actor(tx.as_mut(), actor).await?;
        tx.delete_session(actor.account_id, actor.session_id)
            .await?;
        tx.commit().await?;

        tracing::info!(account_id = %actor.account_id, session_id = %actor.session_id, "Logged out");
        Ok(())
    }

    pub async fn delete_session(
        &self,
        actor: &AccountActor,
        session_id: Uuid,
    ) -> Result<(), ServiceError> {
        let mut tx = self.storage.begin().await?;
        validate_actor(tx.as_mut(), actor).await?;
        if !tx.delete_session(actor.account_id, session_id).await? {
            return Err(ServiceError::SessionNotFound);
        }
        tx.commit().await?;

        tracing::info!(account_id = %actor.account_id, session_id = %session_id, "Session deleted");
        Ok(())
    }

    /// Deletes every session of the caller, including the current one.
    pub async fn delete_all_sessions(&self, actor: &AccountActor) -> Result<u64, ServiceError> {
        let mut tx = self.storage.begin().await?;
        validate_actor(tx.as_mut(), actor).await?;
        let deleted = tx.delete_account_sessions(actor.account_id).await?;
        tx.commit().await?;

        tracing::info!(account_id = %actor.account_id, deleted, "All sessions deleted");
        Ok(deleted)
    }

    /// Buries and deletes the caller's account. Blocked while the account
    /// is still a member of an organization.
    pub async fn delete_account(&self, actor: &AccountActor) -> Result<(), ServiceError> {
        let mut tx = self.storage.begin().await?;
        // Member projection takes the same lock before its tombstone checks.
        tx.lock_entities(&[(EntityType::Account, actor.account_id)])
            .await?;
        validate_actor(tx.as_mut(), actor).await?;

        if tx.account_has_membership(actor.account_id).await? {
            tracing::info!(account_id = %actor.account_id, "Account deletion blocked by membership");
            return Err(ServiceError::AccountHasOrgMembership);
        }

        let now = Utc::now();
        tx.bury(EntityType::Account, actor.account_id, now).await?;
        let buried_sessions = tx.bury_account_sessions(actor.account_id, now).await?;
        tx.delete_account(actor.account_id).await?;
        let message =
            events::account_deleted(actor.account_id, now).map_err(anyhow::Error::from)?;
        enqueue_outbox(tx.as_mut(), message).await?;
        tx.commit().await?;

        tracing::info!(
            account_id = %actor.account_id,
            buried_sessions,
            "Account deleted"
        );
        Ok(())
    }

    pub async fn get_my_account(&self, actor: &AccountActor) -> Result<Account, ServiceError> {
        let mut tx = self.storage.begin().await?;
        let (account, _) = validate_actor(tx.as_mut(), actor).await?;
        tx.rollback().await?;
        Ok(account)
    }

    pub async fn get_my_email(&self, actor: &AccountActor) -> Result<AccountEmail, ServiceError> {
        let mut tx = self.storage.begin().await?;
        validate_actor(tx.as_mut(), actor).await?;
        let email = tx
            .find_account_email(actor.account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        tx.rollback().await?;
        Ok(email)
    }

    pub async fn get_my_session(
        &self,
        actor: &AccountActor,
        session_id: Uuid,
    ) -> Result<Session, ServiceError> {
        let mut tx = self.storage.begin().await?;
        validate_actor(tx.as_mut(), actor).await?;
        let session = tx
            .find_session(session_id)
            .await?
            .filter(|s| s.account_id == actor.account_id)
            .ok_or(ServiceError::SessionNotFound)?;
        tx.rollback().await?;
        Ok(session)
    }

    pub async fn get_my_sessions(
        &self,
        actor: &AccountActor,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Page<Session>, ServiceError> {
        let limit = limit
            .unwrap_or(DEFAULT_SESSIONS_LIMIT)
            .clamp(1, MAX_SESSIONS_LIMIT);
        let offset = offset.unwrap_or(0).max(0);

        let mut tx = self.storage.begin().await?;
        validate_actor(tx.as_mut(), actor).await?;
        let page = tx
            .list_account_sessions(actor.account_id, limit, offset)
            .await?;
        tx.rollback().await?;
        Ok(page)
    }
}

/// Resolves the caller's account and session, telling apart deleted
/// (buried) entities from ones that never existed.
pub async fn validate_actor(
    tx: &mut dyn Transaction,
    actor: &AccountActor,
) -> Result<(Account, Session), ServiceError> {
    let Some(account) = tx.find_account(actor.account_id).await? else {
        let reason = if tx.is_buried(EntityType::Account, actor.account_id).await? {
            "account was deleted"
        } else {
            "account does not exist"
        };
        return Err(ServiceError::AccountInvalidSession(reason.to_string()));
    };

    let Some(session) = tx.find_session(actor.session_id).await? else {
        let reason = if tx.is_buried(EntityType::Session, actor.session_id).await? {
            "session was deleted"
        } else {
            "session does not exist"
        };
        return Err(ServiceError::AccountInvalidSession(reason.to_string()));
    };

    if session.account_id != account.account_id {
        return Err(ServiceError::AccountInvalidSession(
            "session belongs to another account".to_string(),
        ));
    }

    Ok((account, session))
}

async fn enqueue_outbox(
    tx: &mut dyn Transaction,
    message: EventMessage,
) -> Result<(), ServiceError> {
    let record = EventRecord::pending(message, Utc::now());
    tx.enqueue_event(EventBox::Outbox, &record).await?;
    Ok(())
}

fn check_password(raw: &str, stored: &AccountPassword) -> Result<(), ServiceError> {
    let matches = verify_password(
        &Password::new(raw.to_string()),
        &PasswordHashString::new(stored.hash_text.clone()),
    )
    .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password verification error: {}", e)))?;

    if !matches {
        tracing::debug!(account_id = %stored.account_id, "Password mismatch");
        return Err(ServiceError::PasswordInvalid);
    }
    Ok(())
}
