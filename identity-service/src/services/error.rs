use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;

use super::storage::{StorageError, EMAIL_CONSTRAINT, USERNAME_CONSTRAINT};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Email already exists")]
    EmailAlreadyExists,

    #[error("Username is already taken")]
    UsernameTaken,

    #[error("Username is not allowed: {0}")]
    UsernameNotAllowed(String),

    #[error("Password is not allowed: {0}")]
    PasswordNotAllowed(String),

    #[error("Invalid password")]
    PasswordInvalid,

    #[error("Role is not supported: {0}")]
    RoleNotSupported(String),

    #[error("Not enough rights")]
    NotEnoughRights,

    #[error("Account not found")]
    AccountNotFound,

    #[error("Invalid session: {0}")]
    AccountInvalidSession(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session token mismatch")]
    SessionTokenMismatch,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Password cannot be changed before {next_change_at}")]
    CannotChangePasswordYet { next_change_at: DateTime<Utc> },

    #[error("Account still belongs to an organization")]
    AccountHasOrgMembership,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Maps unique-constraint races detected at write time to their domain errors.
    pub fn from_storage_conflict(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(constraint) if constraint == USERNAME_CONSTRAINT => {
                ServiceError::UsernameTaken
            }
            StorageError::Conflict(constraint) if constraint == EMAIL_CONSTRAINT => {
                ServiceError::EmailAlreadyExists
            }
            other => ServiceError::Storage(other),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::UsernameNotAllowed(_)
            | ServiceError::PasswordNotAllowed(_)
            | ServiceError::RoleNotSupported(_) => AppError::BadRequest(anyhow::anyhow!("{}", err)),
            ServiceError::PasswordInvalid
            | ServiceError::AccountNotFound
            | ServiceError::AccountInvalidSession(_)
            | ServiceError::SessionNotFound
            | ServiceError::InvalidToken => AppError::Unauthorized(anyhow::anyhow!("{}", err)),
            ServiceError::EmailAlreadyExists
            | ServiceError::UsernameTaken
            | ServiceError::AccountHasOrgMembership => {
                AppError::Conflict(anyhow::anyhow!("{}", err))
            }
            ServiceError::SessionTokenMismatch | ServiceError::NotEnoughRights => {
                AppError::Forbidden(anyhow::anyhow!("{}", err))
            }
            ServiceError::CannotChangePasswordYet { next_change_at } => {
                let retry_after = (next_change_at - Utc::now()).num_seconds().max(1) as u64;
                AppError::TooManyRequests(
                    format!(
                        "Password cannot be changed before {}",
                        next_change_at.to_rfc3339()
                    ),
                    Some(retry_after),
                )
            }
            ServiceError::Storage(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    fn status_of(err: ServiceError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn taxonomy_maps_to_http_status() {
        assert_eq!(
            status_of(ServiceError::PasswordNotAllowed("too short".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ServiceError::AccountInvalidSession("buried".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_of(ServiceError::UsernameTaken), StatusCode::CONFLICT);
        assert_eq!(
            status_of(ServiceError::AccountHasOrgMembership),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ServiceError::SessionTokenMismatch),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(ServiceError::CannotChangePasswordYet {
                next_change_at: Utc::now() + chrono::Duration::minutes(5)
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(ServiceError::Storage(StorageError::Internal("boom".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn constraint_conflicts_map_to_domain_errors() {
        assert!(matches!(
            ServiceError::from_storage_conflict(StorageError::Conflict(
                USERNAME_CONSTRAINT.to_string()
            )),
            ServiceError::UsernameTaken
        ));
        assert!(matches!(
            ServiceError::from_storage_conflict(StorageError::Conflict(
                EMAIL_CONSTRAINT.to_string()
            )),
            ServiceError::EmailAlreadyExists
        ));
        assert!(matches!(
            ServiceError::from_storage_conflict(StorageError::Conflict("other".to_string())),
            ServiceError::Storage(_)
        ));
    }
}
