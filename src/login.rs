#![cfg(not(tarpaulin_include))]

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::{
    Extension, Json,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::app::{AppState, success};
use crate::config::Config;
use crate::error::AppError;
use crate::store::{Document, Store, StoreError};

/// Name of the cookie carrying the session token
pub const SESSION_COOKIE: &str = "session";

const MIN_PASSWORD_LEN: usize = 8;

lazy_static! {
    /// Verified against on unknown usernames so both failure paths cost one argon2 run
    static ref DUMMY_HASH: String = hash_password(&uuid::Uuid::new_v4().to_string())
        .unwrap_or_default();
}

/// Admin account, keyed by username
///
/// Only the Argon2 hash of the password is stored.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Admin {
    /// Username (unique identifier for the admin)
    pub id: String,

    /// Argon2 hash in PHC string format
    pub password_hash: String,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,
}

impl Document for Admin {
    const COLLECTION: &'static str = "admins";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Credentials posted by the login form
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordChange {
    pub current_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// The authenticated admin, attached to every request that passed [`require_auth`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSession {
    pub username: String,
}

/// Session token payload
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

/// Hash a password using Argon2
///
/// # Errors
/// * Returns an error if the password hashing fails
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Password hashing failed: {e}")))
}

/// Verify a password against a stored hash
///
/// # Returns
/// * `Result<bool, AppError>` - True if the password matches, false if not, or an error
///   when the stored hash is malformed
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash format: {e}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

fn validate_new_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Register a new admin account
///
/// # Errors
/// * `BadRequest` for an empty username or a short password
/// * `Conflict` if the username is taken
pub async fn create_admin(store: &Store, username: &str, password: &str) -> Result<Admin, AppError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(AppError::BadRequest("Username cannot be empty".to_string()));
    }
    validate_new_password(password)?;

    let admin = Admin {
        id: username.to_string(),
        password_hash: hash_password(password)?,
        created_at: Utc::now(),
        last_login_at: None,
    };

    match store.insert(admin).await {
        Ok(admin) => {
            info!(username = %admin.id, "admin account created");
            Ok(admin)
        }
        Err(StoreError::Conflict(_)) => Err(AppError::Conflict(format!(
            "Admin {username} already exists"
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Create the admin named by `ADMIN_USERNAME`/`ADMIN_PASSWORD` if it does not exist yet
///
/// Returns whether an account was created.
pub async fn seed_admin(store: &Store, config: &Config) -> Result<bool, AppError> {
    let (Some(username), Some(password)) = (&config.admin_username, &config.admin_password) else {
        if store.count(|_: &Admin| true).await? == 0 {
            warn!("no admin accounts exist; set ADMIN_USERNAME and ADMIN_PASSWORD");
        }
        return Ok(false);
    };

    if store.get::<Admin>(username).await?.is_some() {
        return Ok(false);
    }
    create_admin(store, username, password).await?;
    Ok(true)
}

/// Check credentials and record the login time
///
/// Unknown usernames and wrong passwords are indistinguishable to the caller.
pub async fn authenticate(store: &Store, username: &str, password: &str) -> Result<Admin, AppError> {
    let Some(admin) = store.get::<Admin>(username.trim()).await? else {
        let _ = verify_password(password, &DUMMY_HASH);
        return Err(AppError::Unauthorized);
    };
    if !verify_password(password, &admin.password_hash)? {
        return Err(AppError::Unauthorized);
    }

    let admin = store
        .update(&admin.id, |admin: &mut Admin| {
            admin.last_login_at = Some(Utc::now());
            Ok(admin.clone())
        })
        .await?;
    Ok(admin)
}

pub async fn change_password(
    store: &Store,
    username: &str,
    change: PasswordChange,
) -> Result<(), AppError> {
    if change.new_password != change.confirm_password {
        return Err(AppError::BadRequest("New passwords do not match".to_string()));
    }
    validate_new_password(&change.new_password)?;

    let admin = store
        .get::<Admin>(username)
        .await?
        .ok_or(AppError::Unauthorized)?;
    if !verify_password(&change.current_password, &admin.password_hash)? {
        return Err(AppError::BadRequest("Current password is incorrect".to_string()));
    }

    let password_hash = hash_password(&change.new_password)?;
    store
        .update(username, |admin: &mut Admin| {
            admin.password_hash = password_hash;
            Ok(())
        })
        .await?;

    info!(%username, "admin password changed");
    Ok(())
}

/// Create a signed session token for an authenticated admin
///
/// # Returns
/// * `String` - An HS256 JWT carrying the username and expiry
pub fn create_session_token(username: &str, secret: &str, ttl: Duration) -> Result<String, AppError> {
    let iat = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
    let claims = Claims {
        sub: username.to_string(),
        iat,
        exp: iat + ttl.as_secs(),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Session token signing failed: {e}")))
}

/// Validate a session token
///
/// # Returns
/// * `Option<String>` - The username for the session if valid and not expired
pub fn validate_session(token: &str, secret: &str) -> Option<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .ok()
    .map(|data| data.claims.sub)
}

async fn session_admin(state: &AppState, jar: &CookieJar) -> Option<AdminSession> {
    let cookie = jar.get(SESSION_COOKIE)?;
    let username = validate_session(cookie.value(), &state.config.session_secret)?;

    // Deleted accounts lose their sessions
    match state.store.get::<Admin>(&username).await {
        Ok(Some(_)) => Some(AdminSession { username }),
        _ => None,
    }
}

/// Authentication middleware
///
/// Requests with a valid session cookie get an [`AdminSession`] extension.
/// Other API requests are answered with 401, page requests are redirected to
/// the login page.
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(session) = session_admin(&state, &jar).await {
        request.extensions_mut().insert(session);
        return next.run(request).await;
    }

    let path = request.uri().path();
    if path.starts_with("/api/") {
        return AppError::Unauthorized.into_response();
    }
    Redirect::to(&format!("/login?next={}", urlencoding::encode(path))).into_response()
}

fn secrets_match(given: &[u8], expected: &[u8]) -> bool {
    given.len() == expected.len()
        && given
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Bearer-secret middleware for the cron job and the bot
///
/// Without a configured `CRON_SECRET` every request is rejected.
pub async fn require_service_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(secret) = state.config.cron_secret.as_deref() else {
        return AppError::Unauthorized.into_response();
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| secrets_match(token.trim().as_bytes(), secret.as_bytes()));

    if authorized {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "service request without a valid secret");
        AppError::Unauthorized.into_response()
    }
}

fn session_cookie(token: String, config: &Config) -> Cookie<'static> {
    let max_age = i64::try_from(config.session_ttl.as_secs()).unwrap_or(i64::MAX);
    Cookie::build((SESSION_COOKIE, token))
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(config.cookie_secure)
        .path("/")
        .max_age(time::Duration::seconds(max_age))
        .build()
}

// Web handler functions below

/// Serve the login page, or skip it when already signed in
pub async fn serve_login_page(State(state): State<AppState>, jar: CookieJar) -> Response {
    if session_admin(&state, &jar).await.is_some() {
        return Redirect::to("/dashboard").into_response();
    }
    Html(include_str!("./static/login.html")).into_response()
}

pub async fn serve_dashboard_page() -> Html<&'static str> {
    Html(include_str!("./static/dashboard.html"))
}

pub async fn serve_index() -> Redirect {
    Redirect::to("/dashboard")
}

/// Handle admin login requests
///
/// Validates credentials and sets the HttpOnly session cookie.
pub async fn handle_login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(credentials): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let admin = match authenticate(&state.store, &credentials.username, &credentials.password).await {
        Ok(admin) => admin,
        Err(AppError::Unauthorized) => {
            warn!(username = %credentials.username, "failed login attempt");
            return Err(AppError::Unauthorized);
        }
        Err(e) => return Err(e),
    };

    let token = create_session_token(&admin.id, &state.config.session_secret, state.config.session_ttl)?;
    info!(username = %admin.id, "admin logged in");

    Ok((
        jar.add(session_cookie(token, &state.config)),
        success(json!({ "username": admin.id }))?,
    ))
}

/// Clear the session cookie
pub async fn handle_logout(jar: CookieJar) -> Result<impl IntoResponse, AppError> {
    let cookie = Cookie::build((SESSION_COOKIE, "")).path("/").build();
    Ok((jar.remove(cookie), success(json!({ "logged_out": true }))?))
}

pub async fn handle_me(
    State(state): State<AppState>,
    Extension(session): Extension<AdminSession>,
) -> Result<impl IntoResponse, AppError> {
    let admin = state
        .store
        .get::<Admin>(&session.username)
        .await?
        .ok_or(AppError::Unauthorized)?;

    success(json!({
        "username": admin.id,
        "created_at": admin.created_at,
        "last_login_at": admin.last_login_at,
    }))
}

pub async fn handle_change_password(
    State(state): State<AppState>,
    Extension(session): Extension<AdminSession>,
    Json(change): Json<PasswordChange>,
) -> Result<impl IntoResponse, AppError> {
    change_password(&state.store, &session.username, change).await?;
    success(json!({ "changed": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hashes_verify() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash).unwrap());
        assert!(!verify_password("battery staple", &hash).unwrap());
        assert!(verify_password("anything", "not a hash").is_err());
    }

    #[test]
    fn session_tokens_round_trip_with_the_right_secret() {
        let token = create_session_token("ops", "s3cret", Duration::from_secs(60)).unwrap();
        assert_eq!(validate_session(&token, "s3cret"), Some("ops".to_string()));
        assert_eq!(validate_session(&token, "other"), None);
        assert_eq!(validate_session("garbage", "s3cret"), None);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let claims = Claims {
            sub: "ops".to_string(),
            iat: 1_000,
            exp: 2_000,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"s3cret"),
        )
        .unwrap();
        assert_eq!(validate_session(&token, "s3cret"), None);
    }

    #[test]
    fn secrets_compare_exactly() {
        assert!(secrets_match(b"abc", b"abc"));
        assert!(!secrets_match(b"abc", b"abd"));
        assert!(!secrets_match(b"ab", b"abc"));
    }

    #[tokio::test]
    async fn admins_authenticate_and_change_passwords() {
        let store = Store::in_memory();
        create_admin(&store, "ops", "first-password").await.unwrap();
        assert!(matches!(
            create_admin(&store, "ops", "another-password").await,
            Err(AppError::Conflict(_))
        ));

        assert!(matches!(
            authenticate(&store, "ops", "wrong-password").await,
            Err(AppError::Unauthorized)
        ));
        let admin = authenticate(&store, "ops", "first-password").await.unwrap();
        assert!(admin.last_login_at.is_some());

        let mismatch = PasswordChange {
            current_password: "first-password".to_string(),
            new_password: "second-password".to_string(),
            confirm_password: "typo-password".to_string(),
        };
        assert!(matches!(
            change_password(&store, "ops", mismatch).await,
            Err(AppError::BadRequest(_))
        ));

        let change = PasswordChange {
            current_password: "first-password".to_string(),
            new_password: "second-password".to_string(),
            confirm_password: "second-password".to_string(),
        };
        change_password(&store, "ops", change).await.unwrap();
        assert!(authenticate(&store, "ops", "second-password").await.is_ok());
        assert!(authenticate(&store, "ops", "first-password").await.is_err());
    }

    #[tokio::test]
    async fn seeding_creates_the_admin_once() {
        let store = Store::in_memory();
        let config = Config {
            admin_username: Some("ops".to_string()),
            admin_password: Some("seed-password".to_string()),
            ..Config::default()
        };
        assert!(seed_admin(&store, &config).await.unwrap());
        assert!(!seed_admin(&store, &config).await.unwrap());
        assert_eq!(store.count(|_: &Admin| true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn short_passwords_are_refused() {
        let store = Store::in_memory();
        assert!(matches!(
            create_admin(&store, "ops", "short").await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn unknown_usernames_still_run_a_password_check() {
        assert!(PasswordHash::new(&DUMMY_HASH).is_ok());
        assert!(!verify_password("ops-password", &DUMMY_HASH).unwrap());

        let store = Store::in_memory();
        create_admin(&store, "ops", "ops-password").await.unwrap();
        assert!(matches!(
            authenticate(&store, "ghost", "ops-password").await,
            Err(AppError::Unauthorized)
        ));
    }
}
