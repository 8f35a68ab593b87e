//! Title Normalization
//! Mission: turn a noisy auction title into a canonical product descriptor,
//! merging deterministic signals with an optional AI normalizer.

pub mod ai;
pub mod cache;
pub mod heuristic;

use crate::canonical::{self, AiStateOpinion, Category, ConditionGrade, FunctionalState, Hints, Signatures};
use serde::{Deserialize, Serialize};

/// Everything needed to normalize a raw auction title.
#[derive(Debug, Clone)]
pub struct NormalizeRequest {
    pub raw_title: String,
    pub site_domain: String,
    pub locale: String,
    pub brand_hint: Option<String>,
    pub model_hint: Option<String>,
    pub category_hint: Option<Category>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedProduct {
    pub normalized_title: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub reference: Option<String>,
    pub capacity: Option<String>,
    pub capacity_gb: Option<i64>,
    pub category: Category,
    pub condition_grade: ConditionGrade,
    pub functional_state: FunctionalState,
    pub is_accessory: bool,
    pub query: String,
    pub alt_queries: Vec<String>,
    pub confidence: f32,
    pub condition_confidence: f32,
    pub hints: Hints,
    pub signatures: Signatures,
}

/// The single capability both the AI adapter and the heuristic normalizer
/// provide: produce a `NormalizedProduct` from a `NormalizeRequest`.
#[async_trait::async_trait]
pub trait Normalizer: Send + Sync {
    async fn normalize(&self, req: &NormalizeRequest) -> anyhow::Result<NormalizedProduct>;
}

/// Runs the deterministic hint scan once, then tries the AI backend; falls
/// through to the pure heuristic normalizer on any AI failure or when the
/// backend is disabled. The AI never gets to override high-confidence
/// deterministic signals — `finalize` always re-resolves
/// functional_state/condition_grade after the AI call.
pub struct CompositeNormalizer {
    ai: std::sync::Arc<dyn ai::AiBackend>,
}

impl CompositeNormalizer {
    pub fn new(ai: std::sync::Arc<dyn ai::AiBackend>) -> Self {
        Self { ai }
    }

    pub async fn normalize(&self, req: &NormalizeRequest) -> NormalizedProduct {
        let hints = canonical::build_hints(&req.raw_title);
        let mut heuristic = heuristic::normalize_heuristic(req, &hints);

        match self.ai.normalize(req, &hints).await {
            Ok(ai_product) => merge_ai_into_heuristic(heuristic, ai_product, &hints, req),
            Err(_) => {
                // AI disabled or failed: heuristic already has its own
                // deterministic functional_state/condition_grade; nothing to merge.
                heuristic.signatures = canonical::compute_signatures(&canonical::SignatureInput {
                    brand: heuristic.brand.as_deref(),
                    model: heuristic.model.as_deref(),
                    reference: heuristic.reference.as_deref(),
                    capacity_gb: heuristic.capacity_gb,
                    functional_state: heuristic.functional_state,
                    condition_grade: heuristic.condition_grade,
                    locale: &req.locale,
                });
                heuristic
            }
        }
    }
}

/// Merge an AI opinion into the heuristic base, with the Canonicalizer's
/// resolution rules deciding `functional_state`/`condition_grade` last.
fn merge_ai_into_heuristic(
    mut base: NormalizedProduct,
    ai_product: ai::AiOpinion,
    hints: &Hints,
    req: &NormalizeRequest,
) -> NormalizedProduct {
    if base.brand.is_none() {
        base.brand = ai_product.brand;
    }
    if base.model.is_none() {
        base.model = ai_product.model;
    }
    if base.reference.is_none() {
        base.reference = ai_product.reference;
    }
    if base.capacity_gb.is_none() {
        base.capacity_gb = ai_product.capacity_gb;
    }
    if let Some(ai_conf) = ai_product.confidence {
        base.confidence = base.confidence.max(ai_conf);
    }

    let opinion = AiStateOpinion {
        functional_state: ai_product.functional_state,
        condition_grade: ai_product.condition_grade,
        condition_confidence: ai_product.condition_confidence,
    };

    base.functional_state = canonical::resolve_functional_state(hints.broken_confidence, &opinion);
    base.condition_grade = canonical::resolve_condition_grade(
        base.condition_grade,
        hints.condition_confidence,
        &opinion,
    );

    base.signatures = canonical::compute_signatures(&canonical::SignatureInput {
        brand: base.brand.as_deref(),
        model: base.model.as_deref(),
        reference: base.reference.as_deref(),
        capacity_gb: base.capacity_gb,
        functional_state: base.functional_state,
        condition_grade: base.condition_grade,
        locale: &req.locale,
    });

    base
}

/// Build a deterministic `NormalizedProduct` directly, bypassing both the AI
/// and heuristic calls, per the orchestrator's normalization-skip contract:
/// used when the caller already supplies both brand and model.
/// `functional_state` is inferred only from deterministic hints (no AI
/// opinion is consulted).
pub fn normalize_deterministic(req: &NormalizeRequest, brand: &str, model: &str) -> NormalizedProduct {
    normalize_deterministic_from_hints(req, Some(brand), Some(model))
}

/// Same deterministic, no-AI-no-heuristic build as [`normalize_deterministic`],
/// but with `brand`/`model` optional — used for the
/// `extractionConfidence == high` branch of the normalization-skip contract,
/// where the caller asserts confidence in its own extraction without
/// necessarily supplying both fields. Any field left unresolved here stays
/// `None` rather than being heuristically guessed; `confidence` is always
/// fixed at 0.8 and `functional_state` is resolved from hints alone.
pub fn normalize_deterministic_from_hints(
    req: &NormalizeRequest,
    brand: Option<&str>,
    model: Option<&str>,
) -> NormalizedProduct {
    let hints = canonical::build_hints(&req.raw_title);
    let capacity_gb = canonical::parse_capacity_gb(&req.raw_title);
    let category = req.category_hint.unwrap_or(Category::Product);

    let (_, condition_grade, condition_confidence) = canonical::detect_condition_hints(&req.raw_title);
    let functional_state =
        canonical::resolve_functional_state(hints.broken_confidence, &AiStateOpinion::default());

    let query = heuristic::build_query(
        brand.unwrap_or(""),
        model.unwrap_or(""),
        capacity_gb,
        category,
        &req.raw_title,
    );
    let alt_queries = heuristic::build_alt_queries(brand.unwrap_or(""), model.unwrap_or(""), &req.raw_title);

    let brand = brand.map(canonical::normalize_brand);
    let model = model.map(|m| m.to_string());

    let signatures = canonical::compute_signatures(&canonical::SignatureInput {
        brand: brand.as_deref(),
        model: model.as_deref(),
        reference: None,
        capacity_gb,
        functional_state,
        condition_grade,
        locale: &req.locale,
    });

    NormalizedProduct {
        normalized_title: heuristic::strip_boilerplate(&req.raw_title),
        brand,
        model,
        reference: None,
        capacity: capacity_gb.and_then(|_| heuristic::raw_capacity_token(&req.raw_title)),
        capacity_gb,
        category,
        condition_grade,
        functional_state,
        is_accessory: heuristic::looks_like_accessory(&req.raw_title),
        query,
        alt_queries,
        confidence: 0.8,
        condition_confidence,
        hints,
        signatures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(title: &str) -> NormalizeRequest {
        NormalizeRequest {
            raw_title: title.to_string(),
            site_domain: "example.test".to_string(),
            locale: "fr".to_string(),
            brand_hint: None,
            model_hint: None,
            category_hint: Some(Category::Product),
        }
    }

    #[test]
    fn deterministic_bypass_sets_fixed_confidence() {
        let np = normalize_deterministic(&req("iPhone 13 Pro 256 Go"), "Apple", "iPhone 13 Pro");
        assert_eq!(np.confidence, 0.8);
        assert_eq!(np.brand.as_deref(), Some("Apple"));
        assert_eq!(np.capacity_gb, Some(256));
    }

    #[test]
    fn idempotent_on_already_clean_input() {
        let first = normalize_deterministic(&req("iPhone 13 Pro 256 Go"), "Apple", "iPhone 13 Pro");
        let again = normalize_deterministic(
            &NormalizeRequest {
                raw_title: format!("{} fr", first.normalized_title),
                ..req("iPhone 13 Pro 256 Go")
            },
            "Apple",
            "iPhone 13 Pro",
        );
        assert_eq!(first.signatures.strict.len(), 32);
        assert_eq!(again.brand, first.brand);
    }
}
