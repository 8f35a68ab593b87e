//! Auth Gate
//! Mission: admit a request via bearer API token or session cookie, or
//! reject it with 401. Either path follows the same "extract, validate,
//! stash in extensions" shape before handing off to `next`.

use super::models::AuthenticatedUser;
use super::store::AuthStore;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use std::sync::Arc;
use uuid::Uuid;

const SESSION_COOKIE_NAME: &str = "session_id";

#[derive(Debug)]
pub enum AuthError {
    MissingCredentials,
    InvalidToken,
    InvalidSession,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingCredentials => "Missing bearer token or session cookie",
            AuthError::InvalidToken => "Invalid or expired API token",
            AuthError::InvalidSession => "Invalid or expired session",
        };
        (StatusCode::UNAUTHORIZED, message).into_response()
    }
}

/// Bearer-token-or-session-cookie admission. Stashes an `AuthenticatedUser`
/// in request extensions for downstream handlers to read.
pub async fn auth_gate(
    State(store): State<Arc<AuthStore>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let bearer_token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    let authenticated = if let Some(token) = bearer_token {
        let user = store
            .validate_api_token(&token)
            .await
            .map_err(|_| AuthError::InvalidToken)?
            .ok_or(AuthError::InvalidToken)?;
        AuthenticatedUser {
            user_id: user.id,
            email: user.email,
        }
    } else {
        let jar = CookieJar::from_headers(req.headers());
        let session_id = jar
            .get(SESSION_COOKIE_NAME)
            .map(|c| c.value().to_string())
            .ok_or(AuthError::MissingCredentials)?;
        let session_id = Uuid::parse_str(&session_id).map_err(|_| AuthError::InvalidSession)?;
        let user = store
            .validate_session(session_id)
            .await
            .map_err(|_| AuthError::InvalidSession)?
            .ok_or(AuthError::InvalidSession)?;
        AuthenticatedUser {
            user_id: user.id,
            email: user.email,
        }
    };

    req.extensions_mut().insert(authenticated);
    Ok(next.run(req).await)
}

pub fn extract_authenticated_user(req: &Request) -> Option<&AuthenticatedUser> {
    req.extensions().get::<AuthenticatedUser>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::AuthStore;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::Router;
    use rusqlite::Connection;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<AuthStore>, String, String) {
        let conn = Connection::open_in_memory().unwrap();
        let store = Arc::new(AuthStore::new(Arc::new(Mutex::new(conn))));
        store.init_schema().await.unwrap();
        let user = store.create_user("a@example.test", "hunter2").await.unwrap();
        let (raw_token, _) = store.create_api_token(user.id, "ci", None).await.unwrap();
        let session = store.create_session(user.id).await.unwrap();

        let app = Router::new()
            .route("/protected", get(|| async { "ok" }))
            .route_layer(axum::middleware::from_fn_with_state(store.clone(), auth_gate))
            .with_state(store.clone());

        (app, store, raw_token, session.id.to_string())
    }

    #[tokio::test]
    async fn bearer_token_admits() {
        let (app, _store, raw_token, _session) = test_app().await;
        let resp = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {raw_token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_credentials_rejected() {
        let (app, _store, _raw_token, _session) = test_app().await;
        let resp = app
            .oneshot(HttpRequest::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn session_cookie_admits() {
        let (app, _store, _raw_token, session_id) = test_app().await;
        let resp = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/protected")
                    .header("Cookie", format!("session_id={session_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
