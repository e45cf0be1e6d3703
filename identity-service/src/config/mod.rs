use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Minimum secret length accepted in production.
const MIN_PROD_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub account: AccountConfig,
    pub google: Option<GoogleOAuthConfig>,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub broker: BrokerConfig,
    pub outbox: WorkerConfig,
    pub inbox: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Unset in dev selects the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub issuer: String,
    pub access_secret: String,
    pub refresh_secret: String,
    pub refresh_hash_key: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub password_change_cooldown_minutes: i64,
    /// Delete the session when a stale refresh token is replayed against it.
    pub revoke_session_on_token_mismatch: bool,
}

impl AccountConfig {
    pub fn password_change_cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.password_change_cooldown_minutes)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub events_intake_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub register_attempts: u32,
    pub register_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    Memory,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub mode: BrokerMode,
    pub publish_url: Option<String>,
    pub consumer_group: String,
}

/// Tuning for one event box worker pool.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub routines: usize,
    pub slots: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub min_sleep_ms: u64,
    pub max_sleep_ms: u64,
    pub min_next_attempt_ms: u64,
    pub max_next_attempt_ms: u64,
    pub max_attempts: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            routines: 2,
            slots: 64,
            min_batch: 10,
            max_batch: 100,
            min_sleep_ms: 200,
            max_sleep_ms: 2_000,
            min_next_attempt_ms: 1_000,
            max_next_attempt_ms: 300_000,
            max_attempts: 10,
        }
    }
}

impl WorkerConfig {
    fn from_env(prefix: &str, is_prod: bool) -> Result<Self, AppError> {
        let defaults = WorkerConfig::default();
        let key = |name: &str| format!("{}_{}", prefix, name);

        Ok(WorkerConfig {
            routines: get_parsed(&key("ROUTINES"), defaults.routines, is_prod)?,
            slots: get_parsed(&key("SLOTS"), defaults.slots, is_prod)?,
            min_batch: get_parsed(&key("MIN_BATCH"), defaults.min_batch, is_prod)?,
            max_batch: get_parsed(&key("MAX_BATCH"), defaults.max_batch, is_prod)?,
            min_sleep_ms: get_parsed(&key("MIN_SLEEP_MS"), defaults.min_sleep_ms, is_prod)?,
            max_sleep_ms: get_parsed(&key("MAX_SLEEP_MS"), defaults.max_sleep_ms, is_prod)?,
            min_next_attempt_ms: get_parsed(
                &key("MIN_NEXT_ATTEMPT_MS"),
                defaults.min_next_attempt_ms,
                is_prod,
            )?,
            max_next_attempt_ms: get_parsed(
                &key("MAX_NEXT_ATTEMPT_MS"),
                defaults.max_next_attempt_ms,
                is_prod,
            )?,
            max_attempts: get_parsed(&key("MAX_ATTEMPTS"), defaults.max_attempts, is_prod)?,
        })
    }

    pub fn min_sleep(&self) -> Duration {
        Duration::from_millis(self.min_sleep_ms)
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_millis(self.max_sleep_ms)
    }

    pub fn min_next_attempt(&self) -> Duration {
        Duration::from_millis(self.min_next_attempt_ms)
    }

    pub fn max_next_attempt(&self) -> Duration {
        Duration::from_millis(self.max_next_attempt_ms)
    }

    fn validate(&self, name: &str) -> Result<(), AppError> {
        if self.routines == 0 || self.slots == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{}_ROUTINES and {}_SLOTS must be greater than 0",
                name,
                name
            )));
        }
        if self.min_batch == 0 || self.min_batch > self.max_batch {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{}_MIN_BATCH must be positive and not exceed {}_MAX_BATCH",
                name,
                name
            )));
        }
        if self.min_sleep_ms > self.max_sleep_ms {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{}_MIN_SLEEP_MS must not exceed {}_MAX_SLEEP_MS",
                name,
                name
            )));
        }
        if self.min_next_attempt_ms > self.max_next_attempt_ms {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{}_MIN_NEXT_ATTEMPT_MS must not exceed {}_MAX_NEXT_ATTEMPT_MS",
                name,
                name
            )));
        }
        if self.max_attempts <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "{}_MAX_ATTEMPTS must be positive",
                name
            )));
        }
        Ok(())
    }
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let database_url = if is_prod {
            Some(get_env("DATABASE_URL", None, is_prod)?)
        } else {
            env::var("DATABASE_URL").ok()
        };

        let google = match env::var("GOOGLE_CLIENT_ID") {
            Ok(client_id) => Some(GoogleOAuthConfig {
                client_id,
                client_secret: get_env("GOOGLE_CLIENT_SECRET", None, is_prod)?,
                redirect_uri: get_env("GOOGLE_REDIRECT_URI", None, is_prod)?,
            }),
            Err(_) => None,
        };

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-svc"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: database_url,
                max_connections: get_parsed("DATABASE_MAX_CONNECTIONS", 10, is_prod)?,
            },
            jwt: JwtConfig {
                issuer: get_env("JWT_ISSUER", Some("identity-svc"), is_prod)?,
                access_secret: get_env(
                    "JWT_ACCESS_SECRET",
                    Some("dev-access-secret-change-me-0000000"),
                    is_prod,
                )?,
                refresh_secret: get_env(
                    "JWT_REFRESH_SECRET",
                    Some("dev-refresh-secret-change-me-000000"),
                    is_prod,
                )?,
                refresh_hash_key: get_env(
                    "JWT_REFRESH_HASH_KEY",
                    Some("dev-refresh-hash-key-change-me-0000"),
                    is_prod,
                )?,
                access_token_expiry_minutes: get_parsed(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    15,
                    is_prod,
                )?,
                refresh_token_expiry_days: get_parsed(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    7,
                    is_prod,
                )?,
            },
            account: AccountConfig {
                password_change_cooldown_minutes: get_parsed(
                    "PASSWORD_CHANGE_COOLDOWN_MINUTES",
                    60,
                    is_prod,
                )?,
                revoke_session_on_token_mismatch: get_parsed(
                    "REVOKE_SESSION_ON_TOKEN_MISMATCH",
                    false,
                    is_prod,
                )?,
            },
            google,
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
                events_intake_token: get_env(
                    "EVENTS_INTAKE_TOKEN",
                    Some("dev-events-intake-token-change-me-00"),
                    is_prod,
                )?,
            },
            rate_limit: RateLimitConfig {
                login_attempts: get_parsed("RATE_LIMIT_LOGIN_ATTEMPTS", 5, is_prod)?,
                login_window_seconds: get_parsed("RATE_LIMIT_LOGIN_WINDOW_SECONDS", 900, is_prod)?,
                register_attempts: get_parsed("RATE_LIMIT_REGISTER_ATTEMPTS", 3, is_prod)?,
                register_window_seconds: get_parsed(
                    "RATE_LIMIT_REGISTER_WINDOW_SECONDS",
                    3600,
                    is_prod,
                )?,
                global_ip_limit: get_parsed("RATE_LIMIT_GLOBAL_IP_LIMIT", 100, is_prod)?,
                global_ip_window_seconds: get_parsed(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    60,
                    is_prod,
                )?,
            },
            broker: BrokerConfig {
                mode: get_parsed("BROKER_MODE", BrokerMode::Memory, is_prod)?,
                publish_url: env::var("BROKER_PUBLISH_URL").ok().filter(|s| !s.is_empty()),
                consumer_group: get_env("BROKER_CONSUMER_GROUP", Some("identity-svc"), is_prod)?,
            },
            outbox: WorkerConfig::from_env("OUTBOX", is_prod)?,
            inbox: WorkerConfig::from_env("INBOX", is_prod)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.account.password_change_cooldown_minutes < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PASSWORD_CHANGE_COOLDOWN_MINUTES must not be negative"
            )));
        }

        if self.broker.mode == BrokerMode::Http && self.broker.publish_url.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BROKER_PUBLISH_URL is required when BROKER_MODE=http"
            )));
        }

        self.outbox.validate("OUTBOX")?;
        self.inbox.validate("INBOX")?;

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            let secrets = [
                ("JWT_ACCESS_SECRET", &self.jwt.access_secret),
                ("JWT_REFRESH_SECRET", &self.jwt.refresh_secret),
                ("JWT_REFRESH_HASH_KEY", &self.jwt.refresh_hash_key),
                ("EVENTS_INTAKE_TOKEN", &self.security.events_intake_token),
            ];
            for (key, secret) in secrets {
                if secret.len() < MIN_PROD_SECRET_BYTES {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "{} must be at least {} bytes in production",
                        key,
                        MIN_PROD_SECRET_BYTES
                    )));
                }
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn get_parsed<T>(key: &str, default: T, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => parse_value(key, &val),
        Err(_) if is_prod => Err(AppError::ConfigError(anyhow::anyhow!(
            "{} is required in production but not set",
            key
        ))),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for BrokerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BrokerMode::Memory),
            "http" => Ok(BrokerMode::Http),
            _ => Err(format!("Invalid broker mode: {}", s)),
        }
    }
}
