use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::models::{Account, AccountEmail, Page, Role, Session};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AccountResponse {
    pub account_id: Uuid,
    #[schema(example = "alice")]
    pub username: String,
    pub role: Role,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            account_id: account.account_id,
            username: account.username,
            role: account.role,
            version: account.version,
            created_at: account.created_utc,
            updated_at: account.updated_utc,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EmailResponse {
    #[schema(example = "user@example.com")]
    pub email: String,
    pub verified: bool,
}

impl From<AccountEmail> for EmailResponse {
    fn from(email: AccountEmail) -> Self {
        Self {
            email: email.email,
            verified: email.verified,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionResponse {
    pub session_id: Uuid,
    /// Whether this is the session the request was made with
    pub current: bool,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SessionResponse {
    pub fn new(session: Session, current_session_id: Uuid) -> Self {
        Self {
            current: session.session_id == current_session_id,
            session_id: session.session_id,
            last_used_at: session.last_used_utc,
            created_at: session.created_utc,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionsPage {
    pub data: Vec<SessionResponse>,
    pub total: i64,
}

impl SessionsPage {
    pub fn new(page: Page<Session>, current_session_id: Uuid) -> Self {
        Self {
            data: page
                .data
                .into_iter()
                .map(|s| SessionResponse::new(s, current_session_id))
                .collect(),
            total: page.total,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SessionsQuery {
    /// Page size, 1-100 (default 20)
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeletedSessionsResponse {
    pub deleted: u64,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateUsernameRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    #[schema(example = "alice_2")]
    pub username: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdatePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub old_password: String,

    #[validate(length(min = 8, max = 32, message = "Password must be 8-32 characters"))]
    pub new_password: String,
}
