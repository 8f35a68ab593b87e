//! compare-backend
//!
//! Auction-listing price-comparison server: normalizes a noisy auction
//! title into a canonical product descriptor, resolves it against a
//! shared signature-keyed cache, and on a miss runs a credit-gated,
//! deduplicated fresh fetch against the shopping provider before scoring
//! and persisting the result. See `orchestrator::CompareOrchestrator` for
//! the state machine; this binary only wires dependencies together and
//! exposes them over HTTP.

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use compare_backend::api::{self, AppState};
use compare_backend::auth::{auth_gate, AuthStore};
use compare_backend::cache_store::CompareCacheStore;
use compare_backend::config::{AiProviderKind, Config};
use compare_backend::dedup::InFlightDeduper;
use compare_backend::ledger::CreditLedger;
use compare_backend::middleware::request_logging;
use compare_backend::normalize::ai::build_backend;
use compare_backend::normalize::cache::NormalizationCache;
use compare_backend::normalize::CompositeNormalizer;
use compare_backend::orchestrator::CompareOrchestrator;
use compare_backend::rate_limit::RateLimiter;
use compare_backend::shopping::{HttpShoppingProvider, ShoppingProvider, StaticShoppingProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    let prometheus_handle = compare_backend::metrics::install_recorder();

    let conn = compare_backend::db::open(&config.database_path)
        .with_context(|| format!("failed to open database at {}", config.database_path))?;

    let auth = Arc::new(AuthStore::new(conn.clone()));
    auth.init_schema().await.context("failed to initialize auth schema")?;

    let cache = Arc::new(CompareCacheStore::new(conn.clone()));
    cache.init_schema().await.context("failed to initialize cache schema")?;

    let ledger = Arc::new(CreditLedger::new(conn.clone()));
    ledger.init_schema().await.context("failed to initialize ledger schema")?;

    let rate_limiter = Arc::new(RateLimiter::new());
    let dedup = Arc::new(InFlightDeduper::new());
    let norm_cache = Arc::new(NormalizationCache::new());

    let ai_backend = build_backend(
        config.ai_provider,
        config.ai_api_key.clone(),
        config.ai_model.clone(),
    );
    if config.ai_provider != AiProviderKind::None {
        info!(provider = ?config.ai_provider, "AI normalizer enabled");
    }
    let normalizer = Arc::new(CompositeNormalizer::new(ai_backend));

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let shopping: Arc<dyn ShoppingProvider> = match &config.shopping_api_key {
        Some(key) => Arc::new(HttpShoppingProvider::new(key.clone())),
        None => {
            tracing::warn!("SHOPPING_API_KEY unset; serving an empty shopping provider");
            Arc::new(StaticShoppingProvider::empty())
        }
    };

    let orchestrator = Arc::new(CompareOrchestrator::new(
        cache.clone(),
        ledger.clone(),
        rate_limiter.clone(),
        dedup.clone(),
        norm_cache.clone(),
        normalizer.clone(),
        shopping,
    ));

    let config = Arc::new(config);
    let state = AppState {
        config: config.clone(),
        auth: auth.clone(),
        orchestrator,
        cache: cache.clone(),
        ledger: ledger.clone(),
        http_client,
    };

    spawn_background_sweeps(cache.clone(), dedup.clone());

    let unauthenticated = Router::new()
        .route("/api/auth/register", post(api::auth::register))
        .route("/api/auth/login", post(api::auth::login))
        .route("/api/billing/credit-packs", get(api::billing::get_credit_packs))
        .route("/api/stripe/webhook", post(api::webhook::stripe_webhook))
        .route("/health", get(health))
        .route("/metrics", get(move || render_metrics(prometheus_handle.clone())));

    let authenticated = Router::new()
        .route("/api/auth/me", get(api::auth::get_current_user))
        .route("/api/compare", post(api::compare::post_compare))
        .route("/api/history", get(api::history::get_history))
        .route("/api/me/credits", get(api::credits::get_credits))
        .route(
            "/api/billing/credit-packs/checkout",
            post(api::billing::post_checkout),
        )
        .route_layer(axum::middleware::from_fn_with_state(auth.clone(), auth_gate));

    let app = Router::new()
        .merge(unauthenticated)
        .merge(authenticated)
        .layer(axum::middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "compare-backend listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn render_metrics(handle: metrics_exporter_prometheus::PrometheusHandle) -> String {
    handle.render()
}

/// Background maintenance: expired compare-cache rows and stale dedup
/// entries are both best-effort, process-local cleanup — neither affects
/// correctness, only memory/storage footprint over time.
fn spawn_background_sweeps(cache: Arc<CompareCacheStore>, dedup: Arc<InFlightDeduper<Vec<compare_backend::relevance::ScoredResult>>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match cache.cleanup_expired_cache().await {
                Ok(n) if n > 0 => info!(removed = n, "swept expired compare-cache entries"),
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "failed to sweep expired compare-cache entries"),
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            dedup.sweep_stale();
        }
    });
}
