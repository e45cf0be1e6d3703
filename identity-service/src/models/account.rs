//! Account model - credentials and profile owned by this service.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Account roles. Only two are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported role: {0}")]
pub struct UnsupportedRole(pub String);

impl FromStr for Role {
    type Err = UnsupportedRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            _ => Err(UnsupportedRole(s.to_string())),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = UnsupportedRole;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Account entity.
#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub account_id: Uuid,
    pub username: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub version: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Account {
    /// Create a new account at version 1.
    pub fn new(username: String, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            account_id: Uuid::new_v4(),
            username,
            role,
            version: 1,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Email bound 1:1 to an account.
#[derive(Debug, Clone, FromRow)]
pub struct AccountEmail {
    pub account_id: Uuid,
    pub email: String,
    pub verified: bool,
    pub version: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl AccountEmail {
    pub fn new(account_id: Uuid, email: String, verified: bool, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            email,
            verified,
            version: 1,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Salted password hash bound 1:1 to an account.
#[derive(Debug, Clone, FromRow)]
pub struct AccountPassword {
    pub account_id: Uuid,
    pub hash_text: String,
    pub version: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl AccountPassword {
    pub fn new(account_id: Uuid, hash_text: String, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            hash_text,
            version: 1,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Earliest moment the password may be changed again.
    ///
    /// A password that was never changed since registration is not subject to
    /// the cooldown.
    pub fn next_change_at(&self, cooldown: Duration) -> DateTime<Utc> {
        if self.version <= 1 {
            return self.updated_utc;
        }
        self.updated_utc + cooldown
    }

    pub fn can_change(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        now >= self.next_change_at(cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(" user ".parse::<Role>().unwrap(), Role::User);
        assert!("moderator".parse::<Role>().is_err());
    }

    #[test]
    fn fresh_password_can_change_immediately() {
        let now = Utc::now();
        let password = AccountPassword::new(Uuid::new_v4(), "hash".to_string(), now);
        assert!(password.can_change(now, Duration::hours(1)));
    }

    #[test]
    fn changed_password_respects_cooldown() {
        let now = Utc::now();
        let mut password = AccountPassword::new(Uuid::new_v4(), "hash".to_string(), now);
        password.version = 2;

        assert!(!password.can_change(now + Duration::minutes(59), Duration::hours(1)));
        assert!(password.can_change(now + Duration::minutes(60), Duration::hours(1)));
    }
}
