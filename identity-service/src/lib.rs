pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;
pub mod workers;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, patch, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::IdentityConfig;
use crate::services::{AuthService, EventBoxService, Storage, TokenSigner};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::metrics::metrics,
        handlers::auth::register,
        handlers::auth::login_by_email,
        handlers::auth::login_by_username,
        handlers::auth::refresh,
        handlers::oauth::google_redirect,
        handlers::oauth::google_callback,
        handlers::account::get_me,
        handlers::account::delete_me,
        handlers::account::get_my_email,
        handlers::account::update_username,
        handlers::account::update_password,
        handlers::account::logout,
        handlers::account::list_sessions,
        handlers::account::delete_all_sessions,
        handlers::account::get_session,
        handlers::account::delete_session,
        handlers::admin::register_account,
        handlers::admin::list_failed_events,
        handlers::admin::purge_failed_events,
        handlers::admin::release_events,
        handlers::events::intake,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::LoginEmailRequest,
            dtos::auth::LoginUsernameRequest,
            dtos::auth::RefreshRequest,
            dtos::auth::TokensResponse,
            dtos::account::AccountResponse,
            dtos::account::EmailResponse,
            dtos::account::SessionResponse,
            dtos::account::SessionsPage,
            dtos::account::DeletedSessionsResponse,
            dtos::account::UpdateUsernameRequest,
            dtos::account::UpdatePasswordRequest,
            dtos::admin::AdminRegisterRequest,
            dtos::admin::EventRecordResponse,
            dtos::admin::ReleaseRequest,
            dtos::admin::AffectedRowsResponse,
            dtos::events::EventHeadersRequest,
            dtos::events::EventIntakeRequest,
            dtos::events::EventIntakeResponse,
            models::Role,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Registration, login and token rotation"),
        (name = "Account", description = "The caller's account and sessions"),
        (name = "Admin", description = "Administrative operations"),
        (name = "Events", description = "Inbound event intake"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "events_token",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(
                    handlers::events::EVENTS_TOKEN_HEADER,
                ))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: IdentityConfig,
    pub storage: Arc<dyn Storage>,
    pub signer: Arc<dyn TokenSigner>,
    pub auth_service: AuthService,
    pub event_box_service: EventBoxService,
    pub http_client: reqwest::Client,
    pub login_rate_limiter: IpRateLimiter,
    pub register_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    pub fn new(
        config: IdentityConfig,
        storage: Arc<dyn Storage>,
        signer: Arc<dyn TokenSigner>,
    ) -> Self {
        let auth_service =
            AuthService::new(storage.clone(), signer.clone(), config.account.clone());
        let event_box_service = EventBoxService::new(storage.clone());

        let login_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.login_attempts,
            config.rate_limit.login_window_seconds,
        );
        let register_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.register_attempts,
            config.rate_limit.register_window_seconds,
        );
        let ip_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.global_ip_limit,
            config.rate_limit.global_ip_window_seconds,
        );

        Self {
            config,
            storage,
            signer,
            auth_service,
            event_box_service,
            http_client: reqwest::Client::new(),
            login_rate_limiter,
            register_rate_limiter,
            ip_rate_limiter,
        }
    }
}

pub fn build_router(state: AppState) -> Result<Router, AppError> {
    let login_route = Router::new()
        .route("/auth/login/email", post(handlers::auth::login_by_email))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let register_route = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .layer(from_fn_with_state(
            state.register_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let me_routes = Router::new()
        .route(
            "/me",
            get(handlers::account::get_me).delete(handlers::account::delete_me),
        )
        .route("/me/email", get(handlers::account::get_my_email))
        .route("/me/username", patch(handlers::account::update_username))
        .route("/me/password", patch(handlers::account::update_password))
        .route("/me/logout", post(handlers::account::logout))
        .route(
            "/me/sessions",
            get(handlers::account::list_sessions).delete(handlers::account::delete_all_sessions),
        )
        .route(
            "/me/sessions/:session_id",
            get(handlers::account::get_session).delete(handlers::account::delete_session),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    // Layers run bottom-up: the token is parsed before the role check.
    let admin_routes = Router::new()
        .route("/admin/accounts", post(handlers::admin::register_account))
        .route(
            "/admin/events/:event_box/failed",
            get(handlers::admin::list_failed_events).delete(handlers::admin::purge_failed_events),
        )
        .route(
            "/admin/events/:event_box/release",
            post(handlers::admin::release_events),
        )
        .layer(from_fn(middleware::require_admin))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    // `*` cannot be mixed into an origin list; dev configs may use it alone.
    let allow_origin = if state.config.security.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            state
                .config
                .security
                .allowed_origins
                .iter()
                .filter_map(|o| match o.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::error!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                        None
                    }
                }),
        )
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .route("/auth/login/username", post(handlers::auth::login_by_username))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/google", get(handlers::oauth::google_redirect))
        .route("/auth/google/callback", get(handlers::oauth::google_callback))
        .route("/internal/events", post(handlers::events::intake))
        .merge(login_route)
        .merge(register_route)
        .merge(me_routes)
        .merge(admin_routes)
        .with_state(state.clone())
        .layer(from_fn_with_state(
            state.ip_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(from_fn(middleware::metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(allow_origin)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static("x-request-id"),
                ]),
        );

    Ok(app)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 500, description = "Storage is unreachable", body = dtos::ErrorResponse)
    ),
    tag = "Observability"
)]
pub async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.storage.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Storage health check failed");
        AppError::DatabaseError(anyhow::Error::new(e))
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "storage": "up"
        }
    })))
}
