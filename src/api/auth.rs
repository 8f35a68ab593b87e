//! `POST /api/auth/register`, `POST /api/auth/login`, `GET /api/auth/me`
//!
//! These routes sit outside `auth_gate` (a caller has no credentials yet
//! when registering or logging in) but issue the same session cookie that
//! the gate validates on every later request.

use super::state::AppState;
use crate::auth::models::{LoginRequest, LoginResponse, UserResponse};
use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use axum::extract::State;
use axum::{Extension, Json};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use time::Duration as CookieDuration;

const SESSION_COOKIE_NAME: &str = "session_id";
const SESSION_COOKIE_DAYS: i64 = 30;

pub async fn register(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), AppError> {
    if req.email.trim().is_empty() || req.password.len() < 8 {
        return Err(AppError::InvalidRequest(
            "email must be non-empty and password must be at least 8 characters".into(),
        ));
    }
    if state.auth.get_user_by_email(&req.email).await?.is_some() {
        return Err(AppError::InvalidRequest("an account with this email already exists".into()));
    }

    let user = state.auth.create_user(&req.email, &req.password).await?;
    state.ledger.grant_free_if_missing(&user.id.to_string()).await?;
    let session = state.auth.create_session(user.id).await?;

    let jar = jar.add(session_cookie(session.id.to_string()));
    Ok((
        jar,
        Json(LoginResponse {
            session_id: session.id.to_string(),
            expires_at: session.expires_at,
            user: UserResponse::from_user(&user),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), AppError> {
    let user = state
        .auth
        .verify_password(&req.email, &req.password)
        .await?
        .ok_or(AppError::Unauthorized("invalid email or password"))?;

    let session = state.auth.create_session(user.id).await?;
    let jar = jar.add(session_cookie(session.id.to_string()));
    Ok((
        jar,
        Json(LoginResponse {
            session_id: session.id.to_string(),
            expires_at: session.expires_at,
            user: UserResponse::from_user(&user),
        }),
    ))
}

pub async fn get_current_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<UserResponse>, AppError> {
    let user = state
        .auth
        .get_user_by_id(user.user_id)
        .await?
        .ok_or(AppError::Unauthorized("user no longer exists"))?;
    Ok(Json(UserResponse::from_user(&user)))
}

fn session_cookie(session_id: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE_NAME, session_id))
        .http_only(true)
        .same_site(axum_extra::extract::cookie::SameSite::Lax)
        .max_age(CookieDuration::days(SESSION_COOKIE_DAYS))
        .path("/")
        .build()
}
