//! Credential policy validation.
//!
//! Passwords: 8 to 32 characters drawn only from ASCII letters, digits and
//! `-.!#$%&?,@`, with at least one uppercase, one lowercase, one digit and
//! one special character. Usernames: 3 to 32 ASCII letters, digits, `_` or
//! `-`.

/// Characters accepted as the "special" class of a password.
pub const PASSWORD_SPECIALS: &str = "-.!#$%&?,@";

pub const PASSWORD_MIN_LENGTH: usize = 8;
pub const PASSWORD_MAX_LENGTH: usize = 32;
pub const USERNAME_MIN_LENGTH: usize = 3;
pub const USERNAME_MAX_LENGTH: usize = 32;

/// Errors related to credential policy validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    PasswordLength { actual_length: usize },
    PasswordMissingUppercase,
    PasswordMissingLowercase,
    PasswordMissingNumber,
    PasswordMissingSpecial,
    PasswordInvalidCharacter(char),
    UsernameLength { actual_length: usize },
    UsernameInvalidCharacter(char),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::PasswordLength { actual_length } => write!(
                f,
                "Password must be between {} and {} characters (got {})",
                PASSWORD_MIN_LENGTH, PASSWORD_MAX_LENGTH, actual_length
            ),
            PolicyError::PasswordMissingUppercase => {
                write!(f, "Password must contain at least one uppercase letter")
            }
            PolicyError::PasswordMissingLowercase => {
                write!(f, "Password must contain at least one lowercase letter")
            }
            PolicyError::PasswordMissingNumber => {
                write!(f, "Password must contain at least one number")
            }
            PolicyError::PasswordMissingSpecial => write!(
                f,
                "Password must contain at least one of {}",
                PASSWORD_SPECIALS
            ),
            PolicyError::PasswordInvalidCharacter(c) => {
                write!(f, "Password contains a disallowed character '{}'", c)
            }
            PolicyError::UsernameLength { actual_length } => write!(
                f,
                "Username must be between {} and {} characters (got {})",
                USERNAME_MIN_LENGTH, USERNAME_MAX_LENGTH, actual_length
            ),
            PolicyError::UsernameInvalidCharacter(c) => write!(
                f,
                "Username may only contain letters, digits, '_' and '-' (found '{}')",
                c
            ),
        }
    }
}

impl std::error::Error for PolicyError {}

/// Credential policy validation.
#[derive(Debug, Clone)]
pub struct PolicyService;

impl PolicyService {
    /// Returns the first violation found, checking length before content.
    pub fn validate_password(password: &str) -> Result<(), PolicyError> {
        let length = password.chars().count();
        if !(PASSWORD_MIN_LENGTH..=PASSWORD_MAX_LENGTH).contains(&length) {
            return Err(PolicyError::PasswordLength {
                actual_length: length,
            });
        }

        let (mut upper, mut lower, mut digit, mut special) = (false, false, false, false);
        for c in password.chars() {
            match c {
                'A'..='Z' => upper = true,
                'a'..='z' => lower = true,
                '0'..='9' => digit = true,
                c if PASSWORD_SPECIALS.contains(c) => special = true,
                c => return Err(PolicyError::PasswordInvalidCharacter(c)),
            }
        }

        if !upper {
            return Err(PolicyError::PasswordMissingUppercase);
        }
        if !lower {
            return Err(PolicyError::PasswordMissingLowercase);
        }
        if !digit {
            return Err(PolicyError::PasswordMissingNumber);
        }
        if !special {
            return Err(PolicyError::PasswordMissingSpecial);
        }
        Ok(())
    }

    pub fn validate_username(username: &str) -> Result<(), PolicyError> {
        let length = username.chars().count();
        if !(USERNAME_MIN_LENGTH..=USERNAME_MAX_LENGTH).contains(&length) {
            return Err(PolicyError::UsernameLength {
                actual_length: length,
            });
        }

        if let Some(c) = username
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(PolicyError::UsernameInvalidCharacter(c));
        }
        Ok(())
    }

    /// Canonical form used for storing and looking up emails.
    pub fn normalize_email(email: &str) -> String {
        email.trim().to_lowercase()
    }
}
