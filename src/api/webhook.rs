//! `POST /api/stripe/webhook`
//!
//! Stripe signs webhook bodies with HMAC-SHA256 over `t=<timestamp>.<body>`
//! (the `Stripe-Signature` header carries `t=...,v1=...,v1=...`). Verified
//! with `hmac` + `sha2` + a constant-time comparison via `hex` decode.
//!
//! This endpoint always answers 200 once the signature checks out, even if
//! the downstream ledger mutation fails — failures are logged and left for
//! manual reconciliation rather than causing Stripe to retry indefinitely.

use super::state::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let Some(secret) = state.config.stripe_webhook_secret.as_deref() else {
        tracing::error!("stripe webhook received but STRIPE_WEBHOOK_SECRET is unset");
        return (StatusCode::BAD_REQUEST, "webhook not configured").into_response();
    };

    let signature_header = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !verify_signature(signature_header, &body, secret) {
        tracing::warn!("stripe webhook signature verification failed");
        return (StatusCode::BAD_REQUEST, "invalid signature").into_response();
    }

    let event: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(error = %err, "stripe webhook body is not valid JSON");
            return (StatusCode::BAD_REQUEST, "invalid payload").into_response();
        }
    };

    if let Err(err) = handle_event(&state, &event).await {
        tracing::error!(error = %err, "failed to apply stripe webhook event");
    }

    Json(json!({ "received": true })).into_response()
}

fn verify_signature(header: &str, body: &[u8], secret: &str) -> bool {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let mut kv = part.splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(v)) => timestamp = Some(v),
            (Some("v1"), Some(v)) => signatures.push(v),
            _ => {}
        }
    }
    let (Some(timestamp), false) = (timestamp, signatures.is_empty()) else {
        return false;
    };

    let signed_payload = [timestamp.as_bytes(), b".", body].concat();

    signatures.iter().any(|s| {
        let Ok(decoded) = hex::decode(s) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(&signed_payload);
        mac.verify_slice(&decoded).is_ok()
    })
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: Value,
}

async fn handle_event(state: &AppState, raw: &Value) -> anyhow::Result<()> {
    let event: StripeEvent = serde_json::from_value(raw.clone())?;

    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let session = event.data.object;
            let session_id = session
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("checkout session missing id"))?;
            let metadata = session.get("metadata");
            let pack_id = metadata
                .and_then(|m| m.get("pack_id"))
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("checkout session missing pack_id metadata"))?;
            // The purchase row's id, embedded as metadata at checkout
            // creation time (see `api::billing::post_checkout`) — the only
            // correlation key available before the real payment intent
            // exists. Never trust `credits`/`priceCents` from here; those
            // come exclusively from the registry inside `handle_checkout_completed`.
            let purchase_id: i64 = metadata
                .and_then(|m| m.get("purchase_id"))
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("checkout session missing purchase_id metadata"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("checkout session purchase_id metadata is not an integer"))?;
            let payment_intent = session
                .get("payment_intent")
                .and_then(Value::as_str)
                .unwrap_or(session_id);

            state
                .ledger
                .handle_checkout_completed(purchase_id, session_id, payment_intent, pack_id, &event.id, "stripe")
                .await?;
        }
        "charge.refunded" => {
            let charge = event.data.object;
            let payment_intent = charge
                .get("payment_intent")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("refunded charge missing payment_intent"))?;
            state
                .ledger
                .handle_charge_refunded(payment_intent, "stripe refund")
                .await?;
        }
        other => {
            tracing::debug!(event_type = other, "ignoring unhandled stripe event type");
        }
    }
    Ok(())
}
