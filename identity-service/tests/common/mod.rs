//! Shared setup for identity-service integration tests.
//!
//! Everything runs against `MemoryStorage` and `MemoryBroker`, so no
//! external services are needed.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request, Response, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use identity_service::{
    build_router,
    config::{
        AccountConfig, BrokerConfig, BrokerMode, DatabaseConfig, Environment, IdentityConfig,
        JwtConfig, RateLimitConfig, SecurityConfig, WorkerConfig,
    },
    models::{AccountActor, EventMessage},
    services::{
        events, AuthService, JwtService, MemoryBroker, MemoryStorage, ProjectionService,
        RegisterParams, TokenSigner, TokensPair,
    },
    workers::{InboxProjector, OutboxRelay},
    AppState,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use uuid::Uuid;

pub const EVENTS_TOKEN: &str = "test-events-intake-token-0123456789";
pub const PASSWORD: &str = "Passw0rd!";

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "identity-svc".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: None,
            max_connections: 5,
        },
        jwt: JwtConfig {
            issuer: "identity-svc".to_string(),
            access_secret: "test-access-secret-0123456789abcdef".to_string(),
            refresh_secret: "test-refresh-secret-0123456789abcdef".to_string(),
            refresh_hash_key: "test-refresh-hash-key-0123456789abc".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        },
        account: AccountConfig {
            password_change_cooldown_minutes: 60,
            revoke_session_on_token_mismatch: false,
        },
        google: None,
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            events_intake_token: EVENTS_TOKEN.to_string(),
        },
        rate_limit: RateLimitConfig {
            login_attempts: 100,
            login_window_seconds: 60,
            register_attempts: 100,
            register_window_seconds: 60,
            global_ip_limit: 1000,
            global_ip_window_seconds: 60,
        },
        broker: BrokerConfig {
            mode: BrokerMode::Memory,
            publish_url: None,
            consumer_group: "identity-svc-test".to_string(),
        },
        outbox: WorkerConfig::default(),
        inbox: WorkerConfig::default(),
    }
}

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("identity_service=debug")
        .with_test_writer()
        .try_init();
}

/// In-memory service wiring plus an HTTP router over the same state.
pub struct TestApp {
    pub config: IdentityConfig,
    pub storage: Arc<MemoryStorage>,
    pub broker: Arc<MemoryBroker>,
    pub signer: Arc<JwtService>,
    pub auth: AuthService,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: IdentityConfig) -> Self {
        init_test_tracing();

        let storage = Arc::new(MemoryStorage::new());
        let broker = Arc::new(MemoryBroker::new());
        let signer = Arc::new(JwtService::new(&config.jwt).expect("jwt service"));

        let state = AppState::new(config.clone(), storage.clone(), signer.clone());
        let auth = state.auth_service.clone();
        let router = build_router(state).expect("router");

        Self {
            config,
            storage,
            broker,
            signer,
            auth,
            router,
        }
    }

    pub fn relay(&self) -> OutboxRelay {
        OutboxRelay::new(
            self.storage.clone(),
            self.broker.clone(),
            self.config.outbox.clone(),
            &self.config.service_name,
        )
    }

    pub fn projector(&self) -> InboxProjector {
        InboxProjector::new(
            self.storage.clone(),
            ProjectionService::new(),
            self.config.inbox.clone(),
            &self.config.service_name,
        )
    }

    pub async fn register(&self, email: &str, username: &str) -> Uuid {
        self.register_with_role(email, username, "user").await
    }

    pub async fn register_with_role(&self, email: &str, username: &str, role: &str) -> Uuid {
        let (account, _) = self
            .auth
            .register(RegisterParams {
                email: email.to_string(),
                username: username.to_string(),
                password: PASSWORD.to_string(),
                role: role.to_string(),
            })
            .await
            .expect("register");
        account.account_id
    }

    pub async fn login(&self, email: &str) -> TokensPair {
        self.auth
            .login_by_email(email, PASSWORD)
            .await
            .expect("login")
    }

    /// Registers and logs in, returning the caller identity and its tokens.
    pub async fn signed_in(&self, email: &str, username: &str) -> (AccountActor, TokensPair) {
        self.register(email, username).await;
        let tokens = self.login(email).await;
        let actor = self
            .signer
            .parse_access(&tokens.access_token)
            .expect("access token")
            .actor();
        (actor, tokens)
    }

    /// Caller identity carried by an access token.
    pub fn signer_actor(&self, access_token: &str) -> Result<AccountActor, anyhow::Error> {
        Ok(self.signer.parse_access(access_token)?.actor())
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        self.router.clone().oneshot(request).await.expect("response")
    }

    pub async fn json(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let response = self.request(method, uri, bearer, body).await;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }
}

pub fn shutdown_token() -> CancellationToken {
    CancellationToken::new()
}

/// Inbound message as another service would produce it.
pub fn inbound<P: Serialize>(topic: &str, key: Uuid, event_type: &str, payload: &P) -> EventMessage {
    let mut message =
        events::json_message(topic, key.to_string(), event_type, payload).expect("message");
    message.headers.producer = "organization-svc".to_string();
    message
}
