//! Auth Storage
//! Mission: persist users, hashed bearer tokens and sessions on the shared
//! connection, following the `Arc<tokio::sync::Mutex<Connection>>` pattern
//! used throughout this crate's persistence layer.

use super::models::{ApiToken, Session, User};
use anyhow::{Context, Result};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SESSION_TTL_DAYS: i64 = 30;

pub fn hash_token(raw_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn generate_raw_token() -> String {
    format!("cmp_live_{}", Uuid::new_v4().simple())
}

pub struct AuthStore {
    conn: Arc<Mutex<Connection>>,
}

impl AuthStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_tokens (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                token_hash TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_used_at TEXT,
                expires_at TEXT,
                revoked INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn create_user(&self, email: &str, password: &str) -> Result<User> {
        let password_hash = hash(password, DEFAULT_COST).context("failed to hash password")?;
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let id = Uuid::new_v4();

        conn.execute(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), email, password_hash, now],
        )?;

        Ok(User {
            id,
            email: email.to_string(),
            password_hash,
            created_at: now,
        })
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, email, password_hash, created_at FROM users WHERE email = ?1",
            params![email],
            map_user_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, email, password_hash, created_at FROM users WHERE id = ?1",
            params![user_id.to_string()],
            map_user_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn verify_password(&self, email: &str, password: &str) -> Result<Option<User>> {
        let user = self.get_user_by_email(email).await?;
        match user {
            Some(user) if verify(password, &user.password_hash).unwrap_or(false) => Ok(Some(user)),
            _ => Ok(None),
        }
    }

    /// Creates a session valid for 30 days, returning its id and expiry.
    pub async fn create_session(&self, user_id: Uuid) -> Result<Session> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let expires_at = now + ChronoDuration::days(SESSION_TTL_DAYS);
        let id = Uuid::new_v4();

        conn.execute(
            "INSERT INTO sessions (id, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), user_id.to_string(), now.to_rfc3339(), expires_at.to_rfc3339()],
        )?;

        Ok(Session {
            id,
            user_id,
            created_at: now.to_rfc3339(),
            expires_at: expires_at.to_rfc3339(),
        })
    }

    /// Validated against `sessions` rows with `expires_at > now`.
    pub async fn validate_session(&self, session_id: Uuid) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let user_id: Option<String> = conn
            .query_row(
                "SELECT user_id FROM sessions WHERE id = ?1 AND expires_at > ?2",
                params![session_id.to_string(), now],
                |r| r.get(0),
            )
            .optional()?;

        match user_id {
            Some(user_id) => {
                let user_id = Uuid::parse_str(&user_id)?;
                conn.query_row(
                    "SELECT id, email, password_hash, created_at FROM users WHERE id = ?1",
                    params![user_id.to_string()],
                    map_user_row,
                )
                .optional()
                .map_err(Into::into)
            }
            None => Ok(None),
        }
    }

    /// Returns the raw token exactly once — only its SHA-256 hash is stored.
    pub async fn create_api_token(
        &self,
        user_id: Uuid,
        name: &str,
        expires_in_days: Option<i64>,
    ) -> Result<(String, ApiToken)> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let raw_token = generate_raw_token();
        let token_hash = hash_token(&raw_token);
        let id = Uuid::new_v4();
        let expires_at = expires_in_days.map(|days| (now + ChronoDuration::days(days)).to_rfc3339());

        conn.execute(
            "INSERT INTO api_tokens (id, user_id, token_hash, name, created_at, last_used_at, expires_at, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, 0)",
            params![id.to_string(), user_id.to_string(), token_hash, name, now.to_rfc3339(), expires_at],
        )?;

        Ok((
            raw_token,
            ApiToken {
                id,
                user_id,
                token_hash,
                name: name.to_string(),
                created_at: now.to_rfc3339(),
                last_used_at: None,
                expires_at,
                revoked: false,
            },
        ))
    }

    /// Matched against non-revoked, non-expired rows; updates `last_used_at`
    /// on success.
    pub async fn validate_api_token(&self, raw_token: &str) -> Result<Option<User>> {
        let token_hash = hash_token(raw_token);
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        let user_id: Option<String> = conn
            .query_row(
                "SELECT user_id FROM api_tokens
                 WHERE token_hash = ?1 AND revoked = 0 AND (expires_at IS NULL OR expires_at > ?2)",
                params![token_hash, now],
                |r| r.get(0),
            )
            .optional()?;

        let user_id = match user_id {
            Some(id) => id,
            None => return Ok(None),
        };

        conn.execute(
            "UPDATE api_tokens SET last_used_at = ?2 WHERE token_hash = ?1",
            params![token_hash, now],
        )?;

        conn.query_row(
            "SELECT id, email, password_hash, created_at FROM users WHERE id = ?1",
            params![user_id],
            map_user_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn revoke_api_token(&self, token_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE api_tokens SET revoked = 1 WHERE id = ?1",
            params![token_id.to_string()],
        )?;
        Ok(())
    }
}

fn map_user_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    Ok(User {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        email: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: row.get(3)?,
    })
}
