//! End-to-end integration tests for the HTTP surface: register, compare,
//! history and credits, driven in-process via `tower::ServiceExt::oneshot`
//! against a `tempfile`-backed SQLite database, a `StaticShoppingProvider`
//! and a `NullAiBackend` — the same "spin up the app, drive it with
//! in-process calls" shape as the teacher's own integration tests.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use compare_backend::api::{self, AppState};
use compare_backend::auth::{auth_gate, AuthStore};
use compare_backend::cache_store::CompareCacheStore;
use compare_backend::config::{AiProviderKind, Config};
use compare_backend::dedup::InFlightDeduper;
use compare_backend::ledger::CreditLedger;
use compare_backend::normalize::ai::NullAiBackend;
use compare_backend::normalize::cache::NormalizationCache;
use compare_backend::normalize::CompositeNormalizer;
use compare_backend::orchestrator::CompareOrchestrator;
use compare_backend::rate_limit::RateLimiter;
use compare_backend::relevance::ScoredResult;
use compare_backend::shopping::StaticShoppingProvider;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

fn test_results() -> Vec<ScoredResult> {
    vec![
        ScoredResult {
            title: "Apple iPhone 13 Pro 256GB".into(),
            url: "https://shop.example/1".into(),
            price: 650.0,
            currency: "EUR".into(),
            relevance: 0.9,
        },
        ScoredResult {
            title: "iPhone 13 Pro 256 Go occasion".into(),
            url: "https://shop.example/2".into(),
            price: 700.0,
            currency: "EUR".into(),
            relevance: 0.85,
        },
        ScoredResult {
            title: "iPhone 13 Pro 256GB unlocked".into(),
            url: "https://shop.example/3".into(),
            price: 680.0,
            currency: "EUR".into(),
            relevance: 0.8,
        },
    ]
}

/// Returns the app plus the auth store and the backing tempfile — the
/// caller must keep the tempfile alive for as long as `app` is in use, since
/// dropping it deletes the underlying SQLite file.
async fn test_app() -> (Router, Arc<AuthStore>, tempfile::NamedTempFile) {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let conn = compare_backend::db::open(db_file.path().to_str().unwrap()).unwrap();

    let auth = Arc::new(AuthStore::new(conn.clone()));
    auth.init_schema().await.unwrap();

    let cache = Arc::new(CompareCacheStore::new(conn.clone()));
    cache.init_schema().await.unwrap();

    let ledger = Arc::new(CreditLedger::new(conn.clone()));
    ledger.init_schema().await.unwrap();

    let rate_limiter = Arc::new(RateLimiter::new());
    let dedup = Arc::new(InFlightDeduper::new());
    let norm_cache = Arc::new(NormalizationCache::new());
    let normalizer = Arc::new(CompositeNormalizer::new(Arc::new(NullAiBackend)));
    let shopping = Arc::new(StaticShoppingProvider::new(test_results()));

    let orchestrator = Arc::new(CompareOrchestrator::new(
        cache.clone(),
        ledger.clone(),
        rate_limiter,
        dedup,
        norm_cache,
        normalizer,
        shopping,
    ));

    let config = Arc::new(Config {
        database_path: ":memory:".to_string(),
        port: 0,
        shopping_api_key: None,
        ai_provider: AiProviderKind::None,
        ai_api_key: None,
        ai_model: None,
        stripe_secret_key: None,
        stripe_webhook_secret: None,
        stripe_price_ids: Default::default(),
        app_base_url: "http://localhost".to_string(),
        free_fresh_fetch_allowance: 1,
    });

    let state = AppState {
        config,
        auth: auth.clone(),
        orchestrator,
        cache,
        ledger,
        http_client: reqwest::Client::new(),
    };

    let unauthenticated = Router::new()
        .route("/api/auth/register", post(api::auth::register))
        .route("/api/auth/login", post(api::auth::login));

    let authenticated = Router::new()
        .route("/api/auth/me", get(api::auth::get_current_user))
        .route("/api/compare", post(api::compare::post_compare))
        .route("/api/history", get(api::history::get_history))
        .route("/api/me/credits", get(api::credits::get_credits))
        .route_layer(axum::middleware::from_fn_with_state(auth.clone(), auth_gate));

    let app = Router::new()
        .merge(unauthenticated)
        .merge(authenticated)
        .with_state(state);

    (app, auth, db_file)
}

fn json_request(method: &str, uri: &str, body: Value, session_cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))));
    if let Some(cookie) = session_cookie {
        builder = builder.header("Cookie", format!("session_id={cookie}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn register_then_compare_then_history_round_trips() {
    let (app, _auth, _db_file) = test_app().await;

    let register_resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/register",
            json!({ "email": "buyer@example.test", "password": "hunter22" }),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(register_resp.status(), StatusCode::OK);
    let register_body = body_json(register_resp).await;
    let session_id = register_body["session_id"].as_str().unwrap().to_string();

    let compare_resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/compare",
            json!({
                "title": "iPhone 13 Pro 256 Go etat neuf",
                "currency": "EUR",
                "locale": "fr",
                "auctionPrice": 300.0,
                "siteDomain": "auction.example",
            }),
            Some(&session_id),
        ))
        .await
        .unwrap();
    assert_eq!(compare_resp.status(), StatusCode::OK);
    let compare_body = body_json(compare_resp).await;
    assert_eq!(compare_body["cache"]["source"], "fresh_fetch");
    assert_eq!(compare_body["stats"]["count"], 3);
    assert_eq!(compare_body["verdict"], "worth_it");

    // A second identical request should resolve from the strict cache.
    let compare_resp_2 = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/compare",
            json!({
                "title": "iPhone 13 Pro 256 Go etat neuf",
                "currency": "EUR",
                "locale": "fr",
                "auctionPrice": 300.0,
                "siteDomain": "auction.example",
            }),
            Some(&session_id),
        ))
        .await
        .unwrap();
    assert_eq!(compare_resp_2.status(), StatusCode::OK);
    let compare_body_2 = body_json(compare_resp_2).await;
    assert_eq!(compare_body_2["cache"]["source"], "cache_strict");

    let history_resp = app
        .clone()
        .oneshot(json_request("GET", "/api/history", json!({}), Some(&session_id)))
        .await
        .unwrap();
    assert_eq!(history_resp.status(), StatusCode::OK);
    let history_body = body_json(history_resp).await;
    assert_eq!(history_body["total"], 2);

    let credits_resp = app
        .oneshot(json_request("GET", "/api/me/credits", json!({}), Some(&session_id)))
        .await
        .unwrap();
    assert_eq!(credits_resp.status(), StatusCode::OK);
    let credits_body = body_json(credits_resp).await;
    assert_eq!(credits_body["balance"], 0);
    assert_eq!(credits_body["freeAvailable"], false);
}

#[tokio::test]
async fn compare_without_credentials_is_rejected() {
    let (app, _auth, _db_file) = test_app().await;
    let resp = app
        .oneshot(json_request(
            "POST",
            "/api/compare",
            json!({
                "title": "iPhone 13",
                "currency": "EUR",
                "locale": "fr",
                "auctionPrice": 300.0,
                "siteDomain": "auction.example",
            }),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn second_account_does_not_see_first_accounts_history() {
    let (app, _auth, _db_file) = test_app().await;

    let register = |email: &'static str| {
        let app = app.clone();
        async move {
            let resp = app
                .oneshot(json_request(
                    "POST",
                    "/api/auth/register",
                    json!({ "email": email, "password": "hunter22" }),
                    None,
                ))
                .await
                .unwrap();
            let body = body_json(resp).await;
            body["session_id"].as_str().unwrap().to_string()
        }
    };

    let session_a = register("a@example.test").await;
    let session_b = register("b@example.test").await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/compare",
            json!({
                "title": "iPhone 13 Pro 256 Go",
                "currency": "EUR",
                "locale": "fr",
                "auctionPrice": 300.0,
                "siteDomain": "auction.example",
            }),
            Some(&session_a),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let history_b = app
        .oneshot(json_request("GET", "/api/history", json!({}), Some(&session_b)))
        .await
        .unwrap();
    let history_b_body = body_json(history_b).await;
    assert_eq!(history_b_body["total"], 0);
}
