//! `GET /api/me/credits`

use super::state::AppState;
use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use axum::extract::State;
use axum::{Extension, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsResponse {
    pub balance: i64,
    pub free_available: bool,
    pub free_credits_amount: i64,
    pub total_purchased: i64,
    pub total_consumed: i64,
}

pub async fn get_credits(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<CreditsResponse>, AppError> {
    let user_id = user.user_id.to_string();
    let availability = state.ledger.has_credits_available(&user_id).await?;
    let (total_purchased, total_consumed) = state.ledger.usage_totals(&user_id).await?;

    Ok(Json(CreditsResponse {
        balance: availability.balance,
        free_available: availability.free_available,
        free_credits_amount: 1,
        total_purchased,
        total_consumed,
    }))
}
