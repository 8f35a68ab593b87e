//! Compare Orchestrator
//! Mission: the single state machine wiring normalization, the compare
//! cache, the credit ledger, the rate limiter and the in-flight deduper
//! behind one endpoint: authenticate (handled by `auth::gate` upstream) ->
//! rate limit -> validate -> normalize -> cache lookup -> (miss) credits
//! gate -> deduplicated fresh fetch -> filter/score -> store -> ledger ->
//! history -> respond.
//!
//! This module only calls into the cache, ledger, rate limiter and dedup;
//! none of them call back into it, so every dependency here is swappable
//! in tests.

use crate::cache_store::{CacheSource, CompareCacheStore};
use crate::canonical::{self, Category, ConditionGrade};
use crate::dedup::InFlightDeduper;
use crate::error::AppError;
use crate::ledger::CreditLedger;
use crate::normalize::{CompositeNormalizer, NormalizeRequest, NormalizedProduct};
use crate::pricing;
use crate::rate_limit::RateLimiter;
use crate::relevance::{self, Confidence, ScoredResult, Stats, Verdict};
use crate::shopping::ShoppingProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Margin used by `relevance::compute_verdict`. Fixed here as a crate-wide
/// constant (10%) rather than an unused configuration knob, since no caller
/// currently has a reason to vary it.
const VERDICT_MARGIN: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionConfidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareRequest {
    pub title: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    pub currency: String,
    pub locale: String,
    pub auction_price: f64,
    pub site_domain: String,
    #[serde(default)]
    pub lot_url: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub extraction_confidence: Option<ExtractionConfidence>,
    #[serde(default)]
    pub force_refresh: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub source: CacheSource,
    pub cache_entry_id: Option<i64>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub signature_used: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedSummary {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub capacity_gb: Option<i64>,
    pub condition_grade: ConditionGrade,
    pub functional_state: crate::canonical::FunctionalState,
    pub category: Category,
    pub signatures: canonical::Signatures,
}

impl From<&NormalizedProduct> for NormalizedSummary {
    fn from(p: &NormalizedProduct) -> Self {
        Self {
            brand: p.brand.clone(),
            model: p.model.clone(),
            capacity_gb: p.capacity_gb,
            condition_grade: p.condition_grade,
            functional_state: p.functional_state,
            category: p.category,
            signatures: p.signatures.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub balance: i64,
    pub free_available: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareResponse {
    pub query_used: String,
    pub results: Vec<ScoredResult>,
    pub stats: Stats,
    pub confidence: Confidence,
    pub verdict: Verdict,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cache: CacheInfo,
    pub normalized: NormalizedSummary,
    pub usage: UsageSnapshot,
}

fn cache_source_str(source: CacheSource) -> &'static str {
    match source {
        CacheSource::CacheStrict => "cache_strict",
        CacheSource::CacheLoose => "cache_loose",
        CacheSource::FreshFetch => "fresh_fetch",
    }
}

fn condition_grade_str(grade: ConditionGrade) -> &'static str {
    match grade {
        ConditionGrade::New => "new",
        ConditionGrade::Used => "used",
        ConditionGrade::Unknown => "unknown",
    }
}

pub struct CompareOrchestrator {
    cache: Arc<CompareCacheStore>,
    ledger: Arc<CreditLedger>,
    rate_limiter: Arc<RateLimiter>,
    dedup: Arc<InFlightDeduper<Vec<ScoredResult>>>,
    norm_cache: Arc<crate::normalize::cache::NormalizationCache>,
    normalizer: Arc<CompositeNormalizer>,
    shopping: Arc<dyn ShoppingProvider>,
}

impl CompareOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<CompareCacheStore>,
        ledger: Arc<CreditLedger>,
        rate_limiter: Arc<RateLimiter>,
        dedup: Arc<InFlightDeduper<Vec<ScoredResult>>>,
        norm_cache: Arc<crate::normalize::cache::NormalizationCache>,
        normalizer: Arc<CompositeNormalizer>,
        shopping: Arc<dyn ShoppingProvider>,
    ) -> Self {
        Self {
            cache,
            ledger,
            rate_limiter,
            dedup,
            norm_cache,
            normalizer,
            shopping,
        }
    }

    fn validate(req: &CompareRequest) -> Result<(), AppError> {
        if req.title.trim().is_empty() {
            return Err(AppError::InvalidRequest("title must not be empty".into()));
        }
        if req.site_domain.trim().is_empty() {
            return Err(AppError::InvalidRequest("siteDomain must not be empty".into()));
        }
        if req.locale.trim().is_empty() {
            return Err(AppError::InvalidRequest("locale must not be empty".into()));
        }
        if req.currency.trim().is_empty() {
            return Err(AppError::InvalidRequest("currency must not be empty".into()));
        }
        if !pricing::is_reasonable_price(req.auction_price) {
            return Err(AppError::InvalidRequest("auctionPrice out of range".into()));
        }
        Ok(())
    }

    /// Normalization-skip contract: deterministic bypass — no AI call, no
    /// heuristic call — when either the caller supplies both brand and
    /// model, or reports `extractionConfidence == high`. Both cases build
    /// the product directly via
    /// `normalize::normalize_deterministic_from_hints` (fixed
    /// `confidence = 0.8`, `functional_state` resolved from hints alone)
    /// and never touch the normalization cache, since the cache's
    /// fingerprint key doesn't encode which of these bypasses applied and a
    /// cached deterministic result must not leak to a later, non-bypassed
    /// call for the same title/locale/site. Everything else goes through
    /// the normalization cache, then the AI/heuristic composite.
    async fn normalize_product(&self, req: &CompareRequest) -> NormalizedProduct {
        let base_req = NormalizeRequest {
            raw_title: req.title.clone(),
            site_domain: req.site_domain.clone(),
            locale: req.locale.clone(),
            brand_hint: req.brand.clone(),
            model_hint: req.model.clone(),
            category_hint: req.category,
        };

        if req.brand.is_some() && req.model.is_some()
            || req.extraction_confidence == Some(ExtractionConfidence::High)
        {
            return crate::normalize::normalize_deterministic_from_hints(
                &base_req,
                req.brand.as_deref(),
                req.model.as_deref(),
            );
        }

        let fingerprint = crate::normalize::cache::fingerprint(
            &req.title,
            &req.locale,
            &req.site_domain,
            req.brand.as_deref(),
            req.model.as_deref(),
        );
        if let Some(cached) = self.norm_cache.get(&fingerprint) {
            return cached;
        }

        let product = self.normalizer.normalize(&base_req).await;

        self.norm_cache.put(fingerprint, product.clone());
        product
    }

    async fn usage_snapshot(&self, user: &str) -> anyhow::Result<UsageSnapshot> {
        let avail = self.ledger.has_credits_available(user).await?;
        Ok(UsageSnapshot {
            balance: avail.balance,
            free_available: avail.free_available,
        })
    }

    pub async fn compare(
        &self,
        user: &str,
        client_ip: &str,
        req: CompareRequest,
    ) -> Result<CompareResponse, AppError> {
        let wait = self.rate_limiter.check(user, client_ip);
        if wait > 0 {
            return Err(AppError::RateLimited {
                retry_after_seconds: wait,
            });
        }

        Self::validate(&req)?;

        let normalized = self.normalize_product(&req).await;

        let resolve = self
            .cache
            .resolve(
                &normalized.signatures.strict,
                &normalized.signatures.loose,
                condition_grade_str(normalized.condition_grade),
                normalized.condition_confidence,
                req.force_refresh.unwrap_or(false),
            )
            .await?;

        crate::metrics::record_cache_resolution(cache_source_str(resolve.source));

        if let Some(entry) = resolve.entry {
            self.cache
                .record_search_history(
                    user,
                    &req.site_domain,
                    req.lot_url.as_deref(),
                    &req.title,
                    &normalized,
                    resolve.source,
                    Some(entry.id),
                    Some(req.auction_price),
                    Some(&req.currency),
                )
                .await?;

            let verdict = relevance::compute_verdict(req.auction_price, &entry.stats, VERDICT_MARGIN);
            let usage = self.usage_snapshot(user).await?;
            let signature_used = match resolve.source {
                CacheSource::CacheLoose => normalized.signatures.loose.clone(),
                _ => normalized.signatures.strict.clone(),
            };

            return Ok(CompareResponse {
                query_used: entry.query_used.clone(),
                results: entry.results.clone(),
                stats: entry.stats,
                confidence: entry.confidence,
                verdict,
                cached_at: entry.fetched_at,
                expires_at: entry.expires_at,
                cache: CacheInfo {
                    source: resolve.source,
                    cache_entry_id: Some(entry.id),
                    fetched_at: entry.fetched_at,
                    expires_at: entry.expires_at,
                    signature_used,
                },
                normalized: NormalizedSummary::from(&normalized),
                usage,
            });
        }

        // Miss: gate on credits before spending on an upstream fetch.
        let availability = self.ledger.has_credits_available(user).await?;
        if !availability.available {
            return Err(AppError::QuotaExceeded {
                free_exhausted: !availability.free_available,
                balance: availability.balance,
            });
        }

        let is_vehicle = normalized.category == Category::Vehicle;
        let query = normalized.query.clone();
        let signature_strict = normalized.signatures.strict.clone();
        let query_for_fetch = query.clone();
        let locale_for_fetch = req.locale.clone();
        let shopping = self.shopping.clone();

        // Shopping-provider errors are swallowed here: the factory never
        // fails, so dedup followers never see an error either — an empty
        // result set just flows into the relevance filter, which
        // surfaces NO_RESULTS after the relax retry if nothing survives.
        let fetch_result = self
            .dedup
            .run(&signature_strict, move || async move {
                Ok(shopping.search(&query_for_fetch, &locale_for_fetch).await.unwrap_or_default())
            })
            .await;
        let raw_results = fetch_result.unwrap_or_default();

        let survivors = relevance::filter(&raw_results, is_vehicle, req.auction_price);

        if survivors.is_empty() {
            // Quota is still consumed for the API call even though nothing
            // is retained.
            let consume = self.ledger.consume_credit(user, &signature_strict).await;
            crate::metrics::record_credit_consume(matches!(&consume, Ok(o) if o.success));
            if let Err(e) = &consume {
                tracing::error!(error = %e, user, "credit consume failed after empty fresh fetch");
            }
            self.cache
                .record_search_history(
                    user,
                    &req.site_domain,
                    req.lot_url.as_deref(),
                    &req.title,
                    &normalized,
                    CacheSource::FreshFetch,
                    None,
                    Some(req.auction_price),
                    Some(&req.currency),
                )
                .await?;
            return Err(AppError::NoResults);
        }

        let stats = relevance::compute_stats(&survivors)
            .expect("non-empty survivors always produce stats");
        let confidence = relevance::compute_confidence(&survivors);
        let verdict = relevance::compute_verdict(req.auction_price, &stats, VERDICT_MARGIN);

        // Cache-first, then best-effort consume, with a reconciliation log
        // on consume failure — recorded as a deliberate tradeoff in
        // DESIGN.md. The cache entry benefits other users even if this
        // caller's own credit consumption loses a race.
        let entry = self
            .cache
            .store(
                &normalized.signatures.strict,
                &normalized.signatures.loose,
                &query,
                &survivors,
                &stats,
                confidence,
                None,
            )
            .await?;

        let consume = self.ledger.consume_credit(user, &signature_strict).await;
        crate::metrics::record_credit_consume(matches!(&consume, Ok(o) if o.success));
        match consume {
            Ok(outcome) if !outcome.success => {
                tracing::warn!(
                    user,
                    "no credits available to consume after a fresh fetch; cache entry retained for reconciliation"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, user, "credit consume transaction failed after fresh fetch; reconciliation needed");
            }
            _ => {}
        }

        self.cache
            .record_search_history(
                user,
                &req.site_domain,
                req.lot_url.as_deref(),
                &req.title,
                &normalized,
                CacheSource::FreshFetch,
                Some(entry.id),
                Some(req.auction_price),
                Some(&req.currency),
            )
            .await?;

        let usage = self.usage_snapshot(user).await?;

        Ok(CompareResponse {
            query_used: query,
            results: survivors,
            stats,
            confidence,
            verdict,
            cached_at: entry.fetched_at,
            expires_at: entry.expires_at,
            cache: CacheInfo {
                source: CacheSource::FreshFetch,
                cache_entry_id: Some(entry.id),
                fetched_at: entry.fetched_at,
                expires_at: entry.expires_at,
                signature_used: normalized.signatures.strict.clone(),
            },
            normalized: NormalizedSummary::from(&normalized),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::CompareCacheStore;
    use crate::config::AiProviderKind;
    use crate::ledger::CreditLedger;
    use crate::normalize::ai::build_backend;
    use crate::normalize::CompositeNormalizer;
    use crate::shopping::StaticShoppingProvider;
    use rusqlite::Connection;
    use tokio::sync::Mutex;

    fn sample_result(price: f64) -> ScoredResult {
        ScoredResult {
            title: "iPhone 13 Pro 256GB".into(),
            url: "https://example.test/item/1".into(),
            price,
            currency: "EUR".into(),
            relevance: 0.9,
        }
    }

    async fn test_orchestrator(results: Vec<ScoredResult>) -> CompareOrchestrator {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let cache = Arc::new(CompareCacheStore::new(conn.clone()));
        cache.init_schema().await.unwrap();
        let ledger = Arc::new(CreditLedger::new(conn.clone()));
        ledger.init_schema().await.unwrap();
        let rate_limiter = Arc::new(RateLimiter::new());
        let dedup = Arc::new(InFlightDeduper::new());
        let norm_cache = Arc::new(crate::normalize::cache::NormalizationCache::new());
        let normalizer = Arc::new(CompositeNormalizer::new(build_backend(
            AiProviderKind::None,
            None,
            None,
        )));
        let shopping: Arc<dyn ShoppingProvider> = if results.is_empty() {
            Arc::new(StaticShoppingProvider::empty())
        } else {
            Arc::new(StaticShoppingProvider::new(results))
        };

        CompareOrchestrator::new(cache, ledger, rate_limiter, dedup, norm_cache, normalizer, shopping)
    }

    fn sample_request() -> CompareRequest {
        CompareRequest {
            title: "iPhone 13 Pro 256 Go".into(),
            brand: None,
            model: None,
            condition: None,
            currency: "EUR".into(),
            locale: "fr".into(),
            auction_price: 400.0,
            site_domain: "example.test".into(),
            lot_url: None,
            category: Some(Category::Product),
            extraction_confidence: None,
            force_refresh: None,
        }
    }

    #[tokio::test]
    async fn new_user_cache_miss_consumes_free_credit() {
        let orchestrator = test_orchestrator(vec![
            sample_result(380.0),
            sample_result(420.0),
            sample_result(450.0),
            sample_result(500.0),
        ])
        .await;

        let resp = orchestrator.compare("alice", "10.0.0.1", sample_request()).await.unwrap();
        assert_eq!(resp.cache.source, CacheSource::FreshFetch);
        assert_eq!(resp.usage.balance, 0);
        assert!(!resp.usage.free_available);
        assert_eq!(resp.normalized.brand.as_deref(), Some("Apple"));
        assert_eq!(resp.normalized.capacity_gb, Some(256));
    }

    #[tokio::test]
    async fn second_user_identical_compare_hits_cache_without_spending_credits() {
        let orchestrator = test_orchestrator(vec![
            sample_result(380.0),
            sample_result(420.0),
            sample_result(450.0),
            sample_result(500.0),
        ])
        .await;

        orchestrator.compare("alice", "10.0.0.1", sample_request()).await.unwrap();
        let resp = orchestrator.compare("bob", "10.0.0.2", sample_request()).await.unwrap();

        assert_eq!(resp.cache.source, CacheSource::CacheStrict);
        // Bob has never consumed anything: he still has his free credit.
        assert_eq!(resp.usage.balance, 0);
        assert!(resp.usage.free_available);
    }

    #[tokio::test]
    async fn broken_title_overrides_ai_and_changes_signature() {
        let orchestrator = test_orchestrator(vec![
            sample_result(50.0),
            sample_result(60.0),
            sample_result(70.0),
            sample_result(80.0),
        ])
        .await;

        let mut broken_req = sample_request();
        broken_req.title = "iPhone 12 HS pour pieces".into();
        let ok_req = sample_request();

        let broken_resp = orchestrator.compare("alice", "10.0.0.1", broken_req).await.unwrap();
        assert_eq!(
            broken_resp.normalized.functional_state,
            crate::canonical::FunctionalState::Broken
        );

        let ok_resp = orchestrator.compare("bob", "10.0.0.2", ok_req).await.unwrap();
        assert_ne!(
            broken_resp.normalized.signatures.strict,
            ok_resp.normalized.signatures.strict
        );
    }

    #[tokio::test]
    async fn no_results_after_relaxed_filter_returns_not_found_but_consumes_credit() {
        let orchestrator = test_orchestrator(vec![]).await;
        let err = orchestrator
            .compare("alice", "10.0.0.1", sample_request())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoResults));

        let avail = orchestrator.ledger.has_credits_available("alice").await.unwrap();
        assert_eq!(avail.balance, 0);
        assert!(!avail.free_available);
    }

    #[tokio::test]
    async fn rate_limited_user_is_rejected_before_any_work() {
        let orchestrator = test_orchestrator(vec![sample_result(400.0)]).await;
        for i in 0..30 {
            let _ = orchestrator
                .compare("alice", &format!("10.0.{i}.1"), sample_request())
                .await;
        }
        let err = orchestrator
            .compare("alice", "10.0.99.1", sample_request())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn invalid_auction_price_is_rejected() {
        let orchestrator = test_orchestrator(vec![sample_result(100.0)]).await;
        let mut req = sample_request();
        req.auction_price = -5.0;
        let err = orchestrator.compare("alice", "10.0.0.1", req).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn deterministic_bypass_skips_ai_and_heuristic() {
        let orchestrator = test_orchestrator(vec![
            sample_result(380.0),
            sample_result(420.0),
            sample_result(450.0),
            sample_result(500.0),
        ])
        .await;
        let mut req = sample_request();
        req.brand = Some("Apple".into());
        req.model = Some("iPhone 13 Pro".into());

        let resp = orchestrator.compare("alice", "10.0.0.1", req).await.unwrap();
        assert_eq!(resp.normalized.brand.as_deref(), Some("Apple"));
    }
}
