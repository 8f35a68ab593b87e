//! `POST /api/compare`

use super::state::AppState;
use crate::auth::AuthenticatedUser;
use crate::cache_store::CacheSource;
use crate::error::AppError;
use crate::orchestrator::{CompareRequest, CompareResponse};
use axum::extract::{ConnectInfo, State};
use axum::{Extension, Json};
use std::net::SocketAddr;
use std::time::Instant;

pub async fn post_compare(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CompareRequest>,
) -> Result<Json<CompareResponse>, AppError> {
    let started = Instant::now();
    let user_id = user.user_id.to_string();

    let result = state
        .orchestrator
        .compare(&user_id, &addr.ip().to_string(), req)
        .await;

    crate::metrics::record_compare_latency(started.elapsed().as_secs_f64());

    match &result {
        Ok(resp) => {
            let source = match resp.cache.source {
                CacheSource::CacheStrict => "cache_strict",
                CacheSource::CacheLoose => "cache_loose",
                CacheSource::FreshFetch => "fresh_fetch",
            };
            crate::metrics::record_compare_request(source);
        }
        Err(AppError::RateLimited { .. }) => crate::metrics::record_rate_limited(),
        Err(_) => {}
    }

    result.map(Json)
}
