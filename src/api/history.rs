//! `GET /api/history`

use super::state::AppState;
use crate::auth::AuthenticatedUser;
use crate::cache_store::{CacheSource, HistoryQuery, SearchHistoryRow};
use crate::error::AppError;
use axum::extract::{Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub compare_source: Option<CacheSource>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub entries: Vec<SearchHistoryRow>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

pub async fn get_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    let user_id = user.user_id.to_string();
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params.page_size.unwrap_or(20).clamp(1, 100);

    let query = HistoryQuery {
        page,
        page_size,
        domain: params.domain.clone(),
        source: params.compare_source,
        start_date: params.start_date,
        end_date: params.end_date,
    };

    let entries = state.cache.get_search_history(&user_id, &query).await?;
    let total = state
        .cache
        .count_search_history(&user_id, params.domain.as_deref())
        .await?;

    Ok(Json(HistoryResponse {
        entries,
        total,
        page,
        page_size,
    }))
}
