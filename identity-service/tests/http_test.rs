mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use axum_extra::extract::cookie::Cookie;
use common::{test_config, TestApp, EVENTS_TOKEN, PASSWORD};
use identity_service::{
    config::GoogleOAuthConfig,
    handlers::{
        events::EVENTS_TOKEN_HEADER,
        oauth::{code_challenge, CODE_VERIFIER_COOKIE, OAUTH_STATE_COOKIE},
    },
    models::EventBox,
    services::events,
};
use serde_json::json;
use tower::util::ServiceExt;
use uuid::Uuid;

async fn login_tokens(app: &TestApp, email: &str) -> serde_json::Value {
    let (status, body) = app
        .json(
            Method::POST,
            "/auth/login/email",
            None,
            Some(json!({ "email": email, "password": PASSWORD })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    body
}

fn intake_body(event_id: Uuid) -> serde_json::Value {
    let member_id = Uuid::new_v4();
    json!({
        "topic": events::ORG_MEMBER_TOPIC_V1,
        "key": member_id.to_string(),
        "headers": {
            "event_id": event_id,
            "event_type": events::ORG_MEMBER_CREATED,
            "event_version": 1,
            "producer": "organization-svc",
            "content_type": "application/json"
        },
        "payload": {
            "member_id": member_id,
            "account_id": Uuid::new_v4(),
            "organization_id": Uuid::new_v4(),
            "created_at": "2024-05-01T12:00:00Z"
        }
    })
}

#[tokio::test]
async fn health_reports_storage_up() {
    let app = TestApp::new();
    let (status, body) = app.json(Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["storage"], "up");
}

#[tokio::test]
async fn metrics_are_exposed_as_text() -> Result<(), anyhow::Error> {
    identity_service::services::metrics::init_metrics()?;
    let app = TestApp::new();
    app.request(Method::GET, "/health", None, None).await;

    let response = app.request(Method::GET, "/metrics", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    Ok(())
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let app = TestApp::new();
    let (status, body) = app
        .json(Method::GET, "/.well-known/openapi.json", None, None)
        .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/auth/register"].is_object());
    assert!(body["paths"]["/me/sessions/{session_id}"].is_object());
}

#[tokio::test]
async fn register_login_and_read_account() {
    let app = TestApp::new();

    let (status, account) = app
        .json(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({
                "email": "user@example.com",
                "username": "alice",
                "password": PASSWORD
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(account["username"], "alice");
    assert_eq!(account["role"], "user");
    assert!(account.get("password").is_none());

    let tokens = login_tokens(&app, "user@example.com").await;
    assert_eq!(tokens["token_type"], "Bearer");
    let access = tokens["access_token"].as_str().unwrap_or_default();

    let (status, me) = app.json(Method::GET, "/me", Some(access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["account_id"], account["account_id"]);

    let (status, email) = app.json(Method::GET, "/me/email", Some(access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(email["email"], "user@example.com");

    let (status, sessions) = app.json(Method::GET, "/me/sessions", Some(access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sessions["total"], 1);
    assert_eq!(sessions["data"][0]["current"], true);
}

#[tokio::test]
async fn invalid_registration_is_rejected() {
    let app = TestApp::new();

    let (status, body) = app
        .json(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({
                "email": "not-an-email",
                "username": "alice",
                "password": PASSWORD
            })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].is_string());

    let (status, _) = app
        .json(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({
                "email": "user@example.com",
                "username": "alice",
                "password": "passw0rd1"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    app.register("user@example.com", "alice").await;
    let (status, _) = app
        .json(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({
                "email": "user@example.com",
                "username": "alice2",
                "password": PASSWORD
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn wrong_credentials_are_unauthorized() {
    let app = TestApp::new();
    app.register("user@example.com", "alice").await;

    let (status, _) = app
        .json(
            Method::POST,
            "/auth/login/username",
            None,
            Some(json!({ "username": "alice", "password": "Wr0ngpass!" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_replay_is_forbidden() {
    let app = TestApp::new();
    app.register("user@example.com", "alice").await;
    let tokens = login_tokens(&app, "user@example.com").await;
    let refresh = tokens["refresh_token"].clone();

    let (status, rotated) = app
        .json(
            Method::POST,
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": refresh })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(rotated["refresh_token"], refresh);
    assert_eq!(rotated["session_id"], tokens["session_id"]);

    let (status, body) = app
        .json(
            Method::POST,
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": refresh })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() {
    let app = TestApp::new();

    let (status, _) = app.json(Method::GET, "/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .json(Method::GET, "/me", Some("garbage.token.value"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A refresh token is not an access token.
    app.register("user@example.com", "alice").await;
    let tokens = login_tokens(&app, "user@example.com").await;
    let refresh = tokens["refresh_token"].as_str().unwrap_or_default();
    let (status, _) = app.json(Method::GET, "/me", Some(refresh), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn session_and_account_lifecycle_over_http() {
    let app = TestApp::new();
    app.register("user@example.com", "alice").await;
    let first = login_tokens(&app, "user@example.com").await;
    let second = login_tokens(&app, "user@example.com").await;
    let access = first["access_token"].as_str().unwrap_or_default();
    let second_id = second["session_id"].as_str().unwrap_or_default();

    let (status, session) = app
        .json(
            Method::GET,
            &format!("/me/sessions/{}", second_id),
            Some(access),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["current"], false);

    let status = app
        .request(
            Method::DELETE,
            &format!("/me/sessions/{}", second_id),
            Some(access),
            None,
        )
        .await
        .status();
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, updated) = app
        .json(
            Method::PATCH,
            "/me/username",
            Some(access),
            Some(json!({ "username": "alice_renamed" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["username"], "alice_renamed");
    assert_eq!(updated["version"], 2);

    let status = app
        .request(Method::DELETE, "/me", Some(access), None)
        .await
        .status();
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = app.json(Method::GET, "/me", Some(access), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"]
        .as_str()
        .is_some_and(|e| e.contains("account was deleted")));
}

#[tokio::test]
async fn password_change_logs_out_everywhere() {
    let app = TestApp::new();
    app.register("user@example.com", "alice").await;
    let tokens = login_tokens(&app, "user@example.com").await;
    let access = tokens["access_token"].as_str().unwrap_or_default();

    let status = app
        .request(
            Method::PATCH,
            "/me/password",
            Some(access),
            Some(json!({ "old_password": PASSWORD, "new_password": "N3wPassw0rd?" })),
        )
        .await
        .status();
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.json(Method::GET, "/me", Some(access), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .json(
            Method::POST,
            "/auth/refresh",
            None,
            Some(json!({ "refresh_token": tokens["refresh_token"] })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_require_admin_role() {
    let app = TestApp::new();
    app.register("user@example.com", "alice").await;
    app.register_with_role("root@example.com", "root", "admin")
        .await;
    let user = login_tokens(&app, "user@example.com").await;
    let admin = login_tokens(&app, "root@example.com").await;
    let user_access = user["access_token"].as_str().unwrap_or_default();
    let admin_access = admin["access_token"].as_str().unwrap_or_default();

    let (status, _) = app
        .json(Method::GET, "/admin/events/outbox/failed", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .json(
            Method::GET,
            "/admin/events/outbox/failed",
            Some(user_access),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .json(
            Method::GET,
            "/admin/events/outbox/failed?limit=10",
            Some(admin_access),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = app
        .json(
            Method::GET,
            "/admin/events/sideways/failed",
            Some(admin_access),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, created) = app
        .json(
            Method::POST,
            "/admin/accounts",
            Some(admin_access),
            Some(json!({
                "email": "ops@example.com",
                "username": "ops",
                "password": PASSWORD,
                "role": "admin"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["role"], "admin");

    let (status, released) = app
        .json(
            Method::POST,
            "/admin/events/inbox/release",
            Some(admin_access),
            Some(json!({ "process_ids": ["identity-svc-inbox-0"] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(released["affected"], 0);
}

#[tokio::test]
async fn event_intake_requires_token_and_deduplicates() {
    let app = TestApp::new();
    let event_id = Uuid::new_v4();
    let body = intake_body(event_id);

    let unauthenticated = Request::builder()
        .method(Method::POST)
        .uri("/internal/events")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = app
        .router
        .clone()
        .oneshot(unauthenticated)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    for expected_stored in [true, false] {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/internal/events")
            .header(header::CONTENT_TYPE, "application/json")
            .header(EVENTS_TOKEN_HEADER, EVENTS_TOKEN)
            .body(Body::from(body.to_string()))
            .expect("request");
        let response = app.router.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let bytes = http_body_util::BodyExt::collect(response.into_body())
            .await
            .expect("body")
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["stored"], expected_stored);
        assert_eq!(value["event_id"], event_id.to_string());
    }

    let inbox = app.storage.events(EventBox::Inbox).await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].producer, "organization-svc");

    let nil = Request::builder()
        .method(Method::POST)
        .uri("/internal/events")
        .header(header::CONTENT_TYPE, "application/json")
        .header(EVENTS_TOKEN_HEADER, EVENTS_TOKEN)
        .body(Body::from(intake_body(Uuid::nil()).to_string()))
        .expect("request");
    let response = app.router.clone().oneshot(nil).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn google_sign_in_is_unavailable_without_configuration() {
    let app = TestApp::new();
    let (status, _) = app.json(Method::GET, "/auth/google", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

fn google_app() -> TestApp {
    let mut config = test_config();
    config.google = Some(GoogleOAuthConfig {
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        redirect_uri: "http://localhost:8080/auth/google/callback".to_string(),
    });
    TestApp::with_config(config)
}

async fn google_callback_status(
    app: &TestApp,
    state: &str,
    cookies: &[Cookie<'_>],
) -> StatusCode {
    let cookie_header = cookies
        .iter()
        .map(|c| c.stripped().to_string())
        .collect::<Vec<_>>()
        .join("; ");
    let callback = Request::builder()
        .method(Method::GET)
        .uri(format!("/auth/google/callback?code=abc&state={}", state))
        .header(header::COOKIE, cookie_header)
        .body(Body::empty())
        .expect("request");
    app.router
        .clone()
        .oneshot(callback)
        .await
        .expect("response")
        .status()
}

#[tokio::test]
async fn google_redirect_sets_state_and_pkce_cookies() {
    let app = google_app();

    let response = app.request(Method::GET, "/auth/google", None, None).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(location.starts_with("https://accounts.google.com/"));
    assert!(location.contains("client_id=client-id"));
    assert!(location.contains("code_challenge_method=S256"));

    let cookies: Vec<Cookie<'static>> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| Cookie::parse(v.to_string()).ok())
        .collect();
    let state = cookies
        .iter()
        .find(|c| c.name() == OAUTH_STATE_COOKIE)
        .expect("state cookie");
    let verifier = cookies
        .iter()
        .find(|c| c.name() == CODE_VERIFIER_COOKIE)
        .expect("verifier cookie");

    for cookie in [state, verifier] {
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.path(), Some("/auth/google"));
    }
    assert!(location.contains(&format!("state={}", state.value())));
    assert!(location.contains(&format!(
        "code_challenge={}",
        code_challenge(verifier.value())
    )));

    // A forged state is rejected before Google is contacted.
    assert_eq!(
        google_callback_status(&app, "forged", &cookies).await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn google_callback_requires_the_code_verifier() {
    let app = google_app();
    let state = Cookie::new(OAUTH_STATE_COOKIE, "state-123");

    assert_eq!(
        google_callback_status(&app, "state-123", &[state]).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        google_callback_status(&app, "state-123", &[]).await,
        StatusCode::BAD_REQUEST
    );
}
