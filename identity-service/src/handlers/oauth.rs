//! Google sign-in.
//!
//! The authorization code is exchanged server side for a Google access
//! token, which resolves the verified email. The email is then logged in
//! like any other account; unknown emails are not registered implicitly.
//! The flow is bound to the browser by a state cookie and a PKCE verifier.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    config::GoogleOAuthConfig,
    dtos::{
        auth::{GoogleCallbackQuery, GoogleTokenResponse, GoogleUserInfo, TokensResponse},
        ErrorResponse,
    },
    services::{hashes_match, metrics::record_auth_operation},
    AppState,
};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

pub const OAUTH_STATE_COOKIE: &str = "google_oauth_state";
pub const CODE_VERIFIER_COOKIE: &str = "google_code_verifier";
const OAUTH_COOKIE_PATH: &str = "/auth/google";
const OAUTH_COOKIE_MAX_AGE_MINUTES: i64 = 10;

fn google_config(state: &AppState) -> Result<&GoogleOAuthConfig, AppError> {
    state.config.google.as_ref().ok_or_else(|| {
        tracing::debug!("Google sign-in requested but not configured");
        AppError::ServiceUnavailable
    })
}

/// Random PKCE code verifier (43 URL-safe characters).
fn code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge of a verifier.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn flow_cookie(name: &'static str, value: String) -> Cookie<'static> {
    Cookie::build((name, value))
        .path(OAUTH_COOKIE_PATH)
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::minutes(OAUTH_COOKIE_MAX_AGE_MINUTES))
        .build()
}

/// Start the Google flow: remember a random state and a PKCE verifier in
/// cookies and send the browser to Google's consent screen.
#[utoipa::path(
    get,
    path = "/auth/google",
    responses(
        (status = 303, description = "Redirect to Google"),
        (status = 503, description = "Google sign-in is not configured", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn google_redirect(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Response), AppError> {
    let google = google_config(&state)?;
    let nonce = Uuid::new_v4().simple().to_string();
    let verifier = code_verifier();

    let auth_url = format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope=openid%20email&state={}&code_challenge={}&code_challenge_method=S256&prompt=select_account",
        GOOGLE_AUTH_URL,
        urlencoding::encode(&google.client_id),
        urlencoding::encode(&google.redirect_uri),
        urlencoding::encode(&nonce),
        code_challenge(&verifier),
    );

    let jar = jar
        .add(flow_cookie(OAUTH_STATE_COOKIE, nonce))
        .add(flow_cookie(CODE_VERIFIER_COOKIE, verifier));

    Ok((jar, Redirect::to(&auth_url).into_response()))
}

/// Finish the Google flow and open a session for the resolved email.
#[utoipa::path(
    get,
    path = "/auth/google/callback",
    params(GoogleCallbackQuery),
    responses(
        (status = 200, description = "Login successful", body = TokensResponse),
        (status = 400, description = "Missing code, state mismatch or missing verifier", body = ErrorResponse),
        (status = 401, description = "No account for the Google email", body = ErrorResponse),
        (status = 502, description = "Google could not be reached", body = ErrorResponse),
        (status = 503, description = "Google sign-in is not configured", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn google_callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<GoogleCallbackQuery>,
) -> Result<(CookieJar, Json<TokensResponse>), AppError> {
    let google = google_config(&state)?;

    if let Some(error) = query.error {
        tracing::warn!(error = %error, "Google OAuth error");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Google sign-in failed: {}",
            error
        )));
    }

    let code = query
        .code
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing authorization code")))?;
    let returned_state = query
        .state
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing state parameter")))?;
    let expected_state = jar
        .get(OAUTH_STATE_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing OAuth state cookie")))?;

    if !hashes_match(&expected_state, &returned_state) {
        tracing::warn!("Google callback state mismatch");
        return Err(AppError::BadRequest(anyhow::anyhow!("OAuth state mismatch")));
    }

    let verifier = jar
        .get(CODE_VERIFIER_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing code verifier")))?;

    let access_token = exchange_code(&state.http_client, google, &code, &verifier).await?;
    let email = fetch_verified_email(&state.http_client, &access_token).await?;

    let result = state.auth_service.login_by_google(&email).await;
    record_auth_operation("login_google", &result);
    let tokens = result?;

    let jar = jar
        .remove(Cookie::build(OAUTH_STATE_COOKIE).path(OAUTH_COOKIE_PATH))
        .remove(Cookie::build(CODE_VERIFIER_COOKIE).path(OAUTH_COOKIE_PATH));

    Ok((jar, Json(tokens.into())))
}

async fn exchange_code(
    client: &reqwest::Client,
    google: &GoogleOAuthConfig,
    code: &str,
    verifier: &str,
) -> Result<String, AppError> {
    let response = client
        .post(GOOGLE_TOKEN_URL)
        .form(&[
            ("code", code),
            ("client_id", google.client_id.as_str()),
            ("client_secret", google.client_secret.as_str()),
            ("redirect_uri", google.redirect_uri.as_str()),
            ("code_verifier", verifier),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await
        .map_err(|e| AppError::BadGateway(format!("Failed to contact Google: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::error!(%status, error = %body, "Google token exchange failed");
        return Err(AppError::BadGateway(
            "Google token exchange failed".to_string(),
        ));
    }

    let tokens = response
        .json::<GoogleTokenResponse>()
        .await
        .map_err(|e| AppError::BadGateway(format!("Failed to parse Google response: {}", e)))?;

    Ok(tokens.access_token)
}

async fn fetch_verified_email(
    client: &reqwest::Client,
    access_token: &str,
) -> Result<String, AppError> {
    let response = client
        .get(GOOGLE_USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| AppError::BadGateway(format!("Failed to contact Google: {}", e)))?;

    if !response.status().is_success() {
        tracing::error!(status = %response.status(), "Google userinfo request failed");
        return Err(AppError::BadGateway(
            "Google userinfo request failed".to_string(),
        ));
    }

    let info = response
        .json::<GoogleUserInfo>()
        .await
        .map_err(|e| AppError::BadGateway(format!("Failed to parse Google userinfo: {}", e)))?;

    match info.email {
        Some(email) if info.email_verified => Ok(email),
        Some(_) => Err(AppError::Unauthorized(anyhow::anyhow!(
            "Google email is not verified"
        ))),
        None => Err(AppError::BadRequest(anyhow::anyhow!(
            "Email not provided by Google"
        ))),
    }
}
