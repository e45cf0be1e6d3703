use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::{Account, AccountActor, Role};

type HmacSha256 = Hmac<Sha256>;

/// Domain separator mixed into every refresh-token hash.
const REFRESH_HASH_PREFIX: &[u8] = b"refresh.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims carried by both access and refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Account id
    pub sub: Uuid,
    /// Session id
    pub sid: Uuid,
    pub role: Role,
    pub typ: TokenKind,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique per token, so two tokens minted in the same second still differ
    pub jti: Uuid,
}

impl SessionClaims {
    pub fn actor(&self) -> AccountActor {
        AccountActor {
            account_id: self.sub,
            session_id: self.sid,
            role: self.role,
        }
    }
}

/// Mints, verifies and hashes session tokens.
pub trait TokenSigner: Send + Sync {
    fn generate_access(&self, account: &Account, session_id: Uuid)
        -> Result<String, anyhow::Error>;

    fn generate_refresh(
        &self,
        account: &Account,
        session_id: Uuid,
    ) -> Result<String, anyhow::Error>;

    fn parse_access(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error>;

    fn parse_refresh(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error>;

    /// Keyed hash of a raw refresh token; the only form ever persisted.
    fn hash_refresh(&self, raw: &str) -> String;

    fn access_token_ttl(&self) -> Duration;
}

/// Constant-time comparison of two refresh hashes.
pub fn hashes_match(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// HS256 JWT signer with separate access and refresh secrets.
#[derive(Clone)]
pub struct JwtService {
    issuer: String,
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    refresh_mac: HmacSha256,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        if config.access_secret.is_empty() || config.refresh_secret.is_empty() {
            return Err(anyhow::anyhow!("JWT secrets must not be empty"));
        }
        if config.access_secret == config.refresh_secret {
            return Err(anyhow::anyhow!(
                "Access and refresh tokens must use different secrets"
            ));
        }

        let refresh_mac = HmacSha256::new_from_slice(config.refresh_hash_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid refresh hash key: {}", e))?;

        tracing::info!(issuer = %config.issuer, "JWT service initialized with HS256 secrets");

        Ok(Self {
            issuer: config.issuer.clone(),
            access_encoding: EncodingKey::from_secret(config.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_mac,
            access_token_ttl: Duration::minutes(config.access_token_expiry_minutes),
            refresh_token_ttl: Duration::days(config.refresh_token_expiry_days),
        })
    }

    fn sign(
        &self,
        account: &Account,
        session_id: Uuid,
        kind: TokenKind,
    ) -> Result<String, anyhow::Error> {
        let (key, ttl) = match kind {
            TokenKind::Access => (&self.access_encoding, self.access_token_ttl),
            TokenKind::Refresh => (&self.refresh_encoding, self.refresh_token_ttl),
        };
        let now = Utc::now();

        let claims = SessionClaims {
            sub: account.account_id,
            sid: session_id,
            role: account.role,
            typ: kind,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: Uuid::new_v4(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, key)
            .map_err(|e| anyhow::anyhow!("Failed to encode {:?} token: {}", kind, e))
    }

    fn verify(
        &self,
        token: &str,
        kind: TokenKind,
    ) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        let key = match kind {
            TokenKind::Access => &self.access_decoding,
            TokenKind::Refresh => &self.refresh_decoding,
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_issuer(&[self.issuer.as_str()]);

        let claims = decode::<SessionClaims>(token, key, &validation)?.claims;
        if claims.typ != kind {
            return Err(ErrorKind::InvalidToken.into());
        }
        Ok(claims)
    }
}

impl TokenSigner for JwtService {
    fn generate_access(
        &self,
        account: &Account,
        session_id: Uuid,
    ) -> Result<String, anyhow::Error> {
        self.sign(account, session_id, TokenKind::Access)
    }

    fn generate_refresh(
        &self,
        account: &Account,
        session_id: Uuid,
    ) -> Result<String, anyhow::Error> {
        self.sign(account, session_id, TokenKind::Refresh)
    }

    fn parse_access(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        self.verify(token, TokenKind::Access)
    }

    fn parse_refresh(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        self.verify(token, TokenKind::Refresh)
    }

    fn hash_refresh(&self, raw: &str) -> String {
        let mut mac = self.refresh_mac.clone();
        mac.update(REFRESH_HASH_PREFIX);
        mac.update(raw.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> JwtConfig {
        JwtConfig {
            issuer: "identity-svc".to_string(),
            access_secret: "access-secret-access-secret-0123".to_string(),
            refresh_secret: "refresh-secret-refresh-secret-01".to_string(),
            refresh_hash_key: "hash-key-hash-key-hash-key-01234".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        }
    }

    fn test_account() -> Account {
        Account::new("alice".to_string(), Role::User, Utc::now())
    }

    #[test]
    fn access_token_round_trip_carries_session_identity() -> Result<(), anyhow::Error> {
        let jwt = JwtService::new(&test_config())?;
        let account = test_account();
        let session_id = Uuid::new_v4();

        let token = jwt.generate_access(&account, session_id)?;
        let claims = jwt.parse_access(&token)?;

        assert_eq!(claims.sub, account.account_id);
        assert_eq!(claims.sid, session_id);
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.typ, TokenKind::Access);
        assert_eq!(claims.iss, "identity-svc");
        Ok(())
    }

    #[test]
    fn token_kinds_are_not_interchangeable() -> Result<(), anyhow::Error> {
        let jwt = JwtService::new(&test_config())?;
        let account = test_account();
        let session_id = Uuid::new_v4();

        let access = jwt.generate_access(&account, session_id)?;
        let refresh = jwt.generate_refresh(&account, session_id)?;

        assert!(jwt.parse_refresh(&access).is_err());
        assert!(jwt.parse_access(&refresh).is_err());
        Ok(())
    }

    #[test]
    fn refresh_tokens_for_one_session_are_unique() -> Result<(), anyhow::Error> {
        let jwt = JwtService::new(&test_config())?;
        let account = test_account();
        let session_id = Uuid::new_v4();

        let first = jwt.generate_refresh(&account, session_id)?;
        let second = jwt.generate_refresh(&account, session_id)?;

        assert_ne!(first, second);
        assert_ne!(jwt.hash_refresh(&first), jwt.hash_refresh(&second));
        Ok(())
    }

    #[test]
    fn refresh_hash_is_deterministic_and_keyed() -> Result<(), anyhow::Error> {
        let jwt = JwtService::new(&test_config())?;
        let mut other_config = test_config();
        other_config.refresh_hash_key = "another-key-another-key-another-k".to_string();
        let other = JwtService::new(&other_config)?;

        let hash = jwt.hash_refresh("raw-token");
        assert_eq!(hash, jwt.hash_refresh("raw-token"));
        assert_ne!(hash, other.hash_refresh("raw-token"));
        assert!(!hash.contains('='));
        assert!(hashes_match(&hash, &jwt.hash_refresh("raw-token")));
        assert!(!hashes_match(&hash, &other.hash_refresh("raw-token")));
        Ok(())
    }

    #[test]
    fn expired_token_is_rejected() -> Result<(), anyhow::Error> {
        let mut config = test_config();
        config.access_token_expiry_minutes = -10;
        let jwt = JwtService::new(&config)?;

        let token = jwt.generate_access(&test_account(), Uuid::new_v4())?;
        let err = jwt.parse_access(&token).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ExpiredSignature);
        Ok(())
    }

    #[test]
    fn foreign_issuer_is_rejected() -> Result<(), anyhow::Error> {
        let jwt = JwtService::new(&test_config())?;
        let mut config = test_config();
        config.issuer = "someone-else".to_string();
        let foreign = JwtService::new(&config)?;

        let token = foreign.generate_access(&test_account(), Uuid::new_v4())?;
        assert!(jwt.parse_access(&token).is_err());
        Ok(())
    }

    #[test]
    fn identical_secrets_are_refused() {
        let mut config = test_config();
        config.refresh_secret = config.access_secret.clone();
        assert!(JwtService::new(&config).is_err());
    }
}
