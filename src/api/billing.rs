//! `GET /api/billing/credit-packs`, `POST /api/billing/credit-packs/checkout`
//!
//! Checkout creates a pending purchase row and a Stripe Checkout Session via
//! a plain `reqwest` POST rather than the `stripe-rust` SDK, to keep the
//! dependency surface aligned with the rest of the crate's outbound HTTP
//! clients.

use super::state::AppState;
use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::ledger::{find_pack, CreditPack, CREDIT_PACKS};
use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreditPacksParams {
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPacksResponse {
    pub packs: Vec<CreditPack>,
    pub free_credits: i64,
    pub cache_hits_free: bool,
}

pub async fn get_credit_packs(
    State(_state): State<AppState>,
    Query(_params): Query<CreditPacksParams>,
) -> Json<CreditPacksResponse> {
    let mut packs = CREDIT_PACKS.to_vec();
    packs.sort_by_key(|p| p.sort_order);
    Json(CreditPacksResponse {
        packs,
        free_credits: 1,
        cache_hits_free: true,
    })
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub pack_id: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

pub async fn post_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, AppError> {
    let pack = find_pack(&req.pack_id)
        .ok_or_else(|| AppError::InvalidRequest(format!("unknown credit pack: {}", req.pack_id)))?;

    let secret_key = state
        .config
        .stripe_secret_key
        .as_deref()
        .ok_or_else(|| AppError::ApiError(anyhow::anyhow!("Stripe is not configured")))?;

    let price_id = stripe_price_id(&state, &req.pack_id)
        .ok_or_else(|| AppError::ApiError(anyhow::anyhow!("no Stripe price configured for {}", req.pack_id)))?;

    let user_id = user.user_id.to_string();
    let purchase_id = state
        .ledger
        .create_pending_purchase(&user_id, "stripe", &req.pack_id, None)
        .await?;

    let success_url = format!("{}/billing/success?purchase={}", state.config.app_base_url, purchase_id);
    let cancel_url = format!("{}/billing/cancel", state.config.app_base_url);

    let resp = state
        .http_client
        .post("https://api.stripe.com/v1/checkout/sessions")
        .basic_auth(secret_key, Some(""))
        .form(&[
            ("mode", "payment"),
            ("success_url", &success_url),
            ("cancel_url", &cancel_url),
            ("line_items[0][price]", &price_id),
            ("line_items[0][quantity]", "1"),
            ("client_reference_id", &user_id),
            ("metadata[pack_id]", &pack.pack_id.to_string()),
            ("metadata[purchase_id]", &purchase_id.to_string()),
        ])
        .send()
        .await
        .map_err(|e| AppError::ApiError(anyhow::anyhow!("Stripe checkout session request failed: {e}")))?;

    let resp = resp
        .error_for_status()
        .map_err(|e| AppError::ApiError(anyhow::anyhow!("Stripe rejected the checkout session: {e}")))?;

    #[derive(Deserialize)]
    struct StripeSession {
        id: String,
        url: String,
    }
    let session: StripeSession = resp
        .json()
        .await
        .map_err(|e| AppError::ApiError(anyhow::anyhow!("failed to parse Stripe response: {e}")))?;

    state
        .ledger
        .attach_checkout_session(purchase_id, &session.id)
        .await?;

    Ok(Json(CheckoutResponse { url: session.url }))
}

fn stripe_price_id(state: &AppState, pack_id: &str) -> Option<String> {
    let ids = &state.config.stripe_price_ids;
    match pack_id {
        "pack_1" => ids.pack_1.clone(),
        "pack_5" => ids.pack_5.clone(),
        "pack_10" => ids.pack_10.clone(),
        "pack_30" => ids.pack_30.clone(),
        "pack_100" => ids.pack_100.clone(),
        _ => None,
    }
}
