//! Canonicalizer
//! Mission: Deterministic hints, capacity normalization, brand/model
//! aliasing, and the content-addressed signature pair used as the cache key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Product,
    Vehicle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionGrade {
    New,
    Used,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionalState {
    Ok,
    Broken,
    Unknown,
}

/// Deterministic detections surfaced alongside a normalized product.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hints {
    pub broken_indicators: Vec<String>,
    pub condition_indicators: Vec<String>,
    pub broken_confidence: f32,
    pub condition_confidence: f32,
}

/// The two content-addressed cache keys, derived from the canonical tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signatures {
    pub strict: String,
    pub loose: String,
}

/// `(broken keyword, weight)` — French + English, weighted 0.5-1.0.
const BROKEN_PATTERNS: &[(&str, f32)] = &[
    ("pour pieces", 1.0),
    ("pour pièces", 1.0),
    ("hs", 1.0),
    ("h.s.", 1.0),
    ("hors service", 1.0),
    ("for parts", 1.0),
    ("for parts only", 1.0),
    ("not working", 0.9),
    ("doesn't work", 0.9),
    ("ne fonctionne pas", 0.9),
    ("broken", 0.8),
    ("cassé", 0.8),
    ("casse", 0.7),
    ("defaut", 0.6),
    ("défaut", 0.6),
    ("defective", 0.6),
    ("as is", 0.5),
    ("en l'état", 0.5),
    ("en l etat", 0.5),
    ("cracked screen", 0.7),
    ("ecran casse", 0.7),
];

/// `(condition keyword, grade, weight)`.
const CONDITION_PATTERNS: &[(&str, ConditionGrade, f32)] = &[
    ("brand new", ConditionGrade::New, 1.0),
    ("neuf", ConditionGrade::New, 1.0),
    ("new sealed", ConditionGrade::New, 1.0),
    ("sealed", ConditionGrade::New, 0.8),
    ("new in box", ConditionGrade::New, 0.9),
    ("jamais servi", ConditionGrade::New, 0.9),
    ("jamais utilise", ConditionGrade::New, 0.8),
    ("new", ConditionGrade::New, 0.7),
    ("used", ConditionGrade::Used, 0.8),
    ("occasion", ConditionGrade::Used, 0.8),
    ("pre-owned", ConditionGrade::Used, 0.8),
    ("preowned", ConditionGrade::Used, 0.8),
    ("second hand", ConditionGrade::Used, 0.75),
    ("d'occasion", ConditionGrade::Used, 0.8),
    ("usage", ConditionGrade::Used, 0.7),
];

/// `(alias substring, canonical brand)`.
const BRAND_ALIASES: &[(&str, &str)] = &[
    ("iphone", "Apple"),
    ("ipad", "Apple"),
    ("macbook", "Apple"),
    ("apple", "Apple"),
    ("galaxy", "Samsung"),
    ("samsung", "Samsung"),
    ("vw", "Volkswagen"),
    ("volkswagen", "Volkswagen"),
    ("pixel", "Google"),
    ("xiaomi", "Xiaomi"),
    ("redmi", "Xiaomi"),
    ("huawei", "Huawei"),
    ("sony", "Sony"),
    ("playstation", "Sony"),
    ("xbox", "Microsoft"),
    ("microsoft", "Microsoft"),
];

/// Scan `raw` for the strongest matching family, returning the matched
/// substrings and the max weight found.
fn scan_weighted(raw: &str, patterns: &[(&str, f32)]) -> (Vec<String>, f32) {
    let lower = raw.to_lowercase();
    let mut matched = Vec::new();
    let mut max_weight = 0.0f32;
    for (pattern, weight) in patterns {
        if lower.contains(pattern) {
            matched.push((*pattern).to_string());
            if *weight > max_weight {
                max_weight = *weight;
            }
        }
    }
    (matched, max_weight)
}

pub fn detect_broken_hints(raw: &str) -> (Vec<String>, f32) {
    scan_weighted(raw, BROKEN_PATTERNS)
}

pub fn detect_condition_hints(raw: &str) -> (Vec<String>, ConditionGrade, f32) {
    let lower = raw.to_lowercase();
    let mut matched = Vec::new();
    let mut best_grade = ConditionGrade::Unknown;
    let mut max_weight = 0.0f32;
    for (pattern, grade, weight) in CONDITION_PATTERNS {
        if lower.contains(pattern) {
            matched.push((*pattern).to_string());
            if *weight > max_weight {
                max_weight = *weight;
                best_grade = *grade;
            }
        }
    }
    (matched, best_grade, max_weight)
}

pub fn build_hints(raw: &str) -> Hints {
    let (broken_indicators, broken_confidence) = detect_broken_hints(raw);
    let (condition_indicators, _grade, condition_confidence) = detect_condition_hints(raw);
    Hints {
        broken_indicators,
        condition_indicators,
        broken_confidence,
        condition_confidence,
    }
}

/// Ordered capacity patterns: TB/To before GB/Go before bare common values.
pub fn parse_capacity_gb(raw: &str) -> Option<i64> {
    let lower = raw.to_lowercase();

    if let Some(gb) = scan_unit(&lower, &["tb", "to"], 1024) {
        return clamp_capacity(gb);
    }
    if let Some(gb) = scan_unit(&lower, &["gb", "go"], 1) {
        return clamp_capacity(gb);
    }

    // Bare common capacities, only when not immediately followed by another
    // unit-like token (e.g. "1.6L" engine displacement should not match "16").
    const COMMON: &[i64] = &[16, 32, 64, 128, 256, 512, 1024, 2048];
    let bytes = lower.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let digits = &lower[start..i];
            if let Ok(n) = digits.parse::<i64>() {
                if COMMON.contains(&n) {
                    let next_is_unit_letter = lower[i..]
                        .chars()
                        .next()
                        .map(|c| c.is_alphabetic())
                        .unwrap_or(false);
                    if !next_is_unit_letter {
                        return clamp_capacity(n);
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    None
}

fn scan_unit(lower: &str, units: &[&str], multiplier: i64) -> Option<i64> {
    for unit in units {
        if let Some(pos) = lower.find(unit) {
            // Walk backwards over the numeric literal (allow a decimal point).
            let prefix = &lower[..pos];
            let digits_end = prefix.trim_end();
            let mut start = digits_end.len();
            let bytes = digits_end.as_bytes();
            let mut seen_dot = false;
            while start > 0 {
                let c = bytes[start - 1] as char;
                if c.is_ascii_digit() {
                    start -= 1;
                } else if c == '.' && !seen_dot {
                    seen_dot = true;
                    start -= 1;
                } else {
                    break;
                }
            }
            if start < digits_end.len() {
                if let Ok(n) = digits_end[start..].parse::<f64>() {
                    return Some((n * multiplier as f64).round() as i64);
                }
            }
        }
    }
    None
}

/// Only plausible values 1..16384 GB are accepted.
fn clamp_capacity(gb: i64) -> Option<i64> {
    if (1..=16384).contains(&gb) {
        Some(gb)
    } else {
        None
    }
}

/// Collapse a subname to its canonical brand, or title-case the input.
pub fn normalize_brand(raw: &str) -> String {
    let lower = raw.to_lowercase();
    for (alias, brand) in BRAND_ALIASES {
        if lower.contains(alias) {
            return brand.to_string();
        }
    }
    title_case(raw)
}

pub fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// AI opinion, as far as the Canonicalizer's state-resolution rules need it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AiStateOpinion {
    pub functional_state: Option<FunctionalState>,
    pub condition_grade: Option<ConditionGrade>,
    pub condition_confidence: Option<f32>,
}

/// Deterministic-first resolution of `functional_state`, per spec §4.B:
/// - `broken_confidence >= 0.8` -> broken, unconditionally.
/// - `0.5 <= broken_confidence < 0.8`: AI broken/unknown -> broken, else unknown (safety).
/// - otherwise: AI value, or `ok`.
pub fn resolve_functional_state(broken_confidence: f32, ai: &AiStateOpinion) -> FunctionalState {
    if broken_confidence >= 0.8 {
        return FunctionalState::Broken;
    }
    if broken_confidence >= 0.5 {
        return match ai.functional_state {
            Some(FunctionalState::Broken) | Some(FunctionalState::Unknown) | None => {
                FunctionalState::Broken
            }
            Some(FunctionalState::Ok) => FunctionalState::Unknown,
        };
    }
    ai.functional_state.unwrap_or(FunctionalState::Ok)
}

/// Deterministic condition grade >= 0.7 confidence wins; else AI (if not
/// unknown); else the deterministic fallback (possibly unknown).
pub fn resolve_condition_grade(
    deterministic_grade: ConditionGrade,
    deterministic_confidence: f32,
    ai: &AiStateOpinion,
) -> ConditionGrade {
    if deterministic_confidence >= 0.7 {
        return deterministic_grade;
    }
    if let Some(grade) = ai.condition_grade {
        if grade != ConditionGrade::Unknown {
            return grade;
        }
    }
    deterministic_grade
}

/// Inputs to the signature tuple, already resolved.
pub struct SignatureInput<'a> {
    pub brand: Option<&'a str>,
    pub model: Option<&'a str>,
    pub reference: Option<&'a str>,
    pub capacity_gb: Option<i64>,
    pub functional_state: FunctionalState,
    pub condition_grade: ConditionGrade,
    pub locale: &'a str,
}

fn lower_trim(s: Option<&str>) -> String {
    s.map(|v| v.trim().to_lowercase()).unwrap_or_default()
}

fn state_str(s: FunctionalState) -> &'static str {
    match s {
        FunctionalState::Ok => "ok",
        FunctionalState::Broken => "broken",
        FunctionalState::Unknown => "unknown",
    }
}

fn grade_str(g: ConditionGrade) -> &'static str {
    match g {
        ConditionGrade::New => "new",
        ConditionGrade::Used => "used",
        ConditionGrade::Unknown => "unknown",
    }
}

fn sha256_hex32(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..32].to_string()
}

/// Pure function of `(brand, model, reference, capacity_gb, functional_state,
/// condition_grade?, locale)`. Strict includes the condition grade; loose omits it.
pub fn compute_signatures(input: &SignatureInput) -> Signatures {
    let capacity_str = input
        .capacity_gb
        .map(|c| c.to_string())
        .unwrap_or_default();

    let base = format!(
        "{}|{}|{}|{}|{}",
        lower_trim(input.brand),
        lower_trim(input.model),
        lower_trim(input.reference),
        capacity_str,
        state_str(input.functional_state),
    );
    let locale = input.locale.trim().to_lowercase();

    let strict_tuple = format!("{}|{}|{}", base, grade_str(input.condition_grade), locale);
    let loose_tuple = format!("{}|{}", base, locale);

    Signatures {
        strict: sha256_hex32(&strict_tuple),
        loose: sha256_hex32(&loose_tuple),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_tb_converts_to_gb() {
        assert_eq!(parse_capacity_gb("2TB SSD"), Some(2048));
        assert_eq!(parse_capacity_gb("1 To"), Some(1024));
    }

    #[test]
    fn capacity_gb_passes_through() {
        assert_eq!(parse_capacity_gb("256GB"), Some(256));
        assert_eq!(parse_capacity_gb("128 Go"), Some(128));
    }

    #[test]
    fn bare_common_capacity_matches() {
        assert_eq!(parse_capacity_gb("iPhone 13 256"), Some(256));
    }

    #[test]
    fn bare_capacity_does_not_match_engine_displacement() {
        // "1.6L" should not be picked up as a 16GB-ish bare capacity.
        assert_eq!(parse_capacity_gb("Golf 1.6L TDI"), None);
    }

    #[test]
    fn out_of_range_capacity_rejected() {
        assert_eq!(parse_capacity_gb("99999GB"), None);
    }

    #[test]
    fn brand_alias_collapses() {
        assert_eq!(normalize_brand("iPhone 13 Pro"), "Apple");
        assert_eq!(normalize_brand("Samsung Galaxy S21"), "Samsung");
        assert_eq!(normalize_brand("VW Golf"), "Volkswagen");
    }

    #[test]
    fn unknown_brand_title_cased() {
        assert_eq!(normalize_brand("nokia lumia"), "Nokia Lumia");
    }

    #[test]
    fn broken_confidence_above_threshold_forces_broken() {
        let ai = AiStateOpinion {
            functional_state: Some(FunctionalState::Ok),
            ..Default::default()
        };
        assert_eq!(resolve_functional_state(1.0, &ai), FunctionalState::Broken);
        assert_eq!(resolve_functional_state(0.8, &ai), FunctionalState::Broken);
    }

    #[test]
    fn mid_confidence_defers_to_ai_with_safety_fallback() {
        let ai_broken = AiStateOpinion {
            functional_state: Some(FunctionalState::Broken),
            ..Default::default()
        };
        assert_eq!(
            resolve_functional_state(0.6, &ai_broken),
            FunctionalState::Broken
        );

        let ai_ok = AiStateOpinion {
            functional_state: Some(FunctionalState::Ok),
            ..Default::default()
        };
        assert_eq!(resolve_functional_state(0.6, &ai_ok), FunctionalState::Unknown);

        let ai_none = AiStateOpinion::default();
        assert_eq!(resolve_functional_state(0.6, &ai_none), FunctionalState::Broken);
    }

    #[test]
    fn low_confidence_uses_ai_or_defaults_ok() {
        let ai_broken = AiStateOpinion {
            functional_state: Some(FunctionalState::Broken),
            ..Default::default()
        };
        assert_eq!(
            resolve_functional_state(0.1, &ai_broken),
            FunctionalState::Broken
        );
        assert_eq!(
            resolve_functional_state(0.1, &AiStateOpinion::default()),
            FunctionalState::Ok
        );
    }

    #[test]
    fn signatures_are_pure_and_case_insensitive() {
        let a = compute_signatures(&SignatureInput {
            brand: Some("Apple"),
            model: Some("iPhone 13 Pro"),
            reference: None,
            capacity_gb: Some(256),
            functional_state: FunctionalState::Ok,
            condition_grade: ConditionGrade::Unknown,
            locale: "fr",
        });
        let b = compute_signatures(&SignatureInput {
            brand: Some("APPLE"),
            model: Some(" iphone 13 pro "),
            reference: None,
            capacity_gb: Some(256),
            functional_state: FunctionalState::Ok,
            condition_grade: ConditionGrade::Unknown,
            locale: "FR",
        });
        assert_eq!(a, b);
    }

    #[test]
    fn loose_signature_ignores_condition_grade() {
        let new = compute_signatures(&SignatureInput {
            brand: Some("Apple"),
            model: Some("iPhone 13"),
            reference: None,
            capacity_gb: Some(128),
            functional_state: FunctionalState::Ok,
            condition_grade: ConditionGrade::New,
            locale: "fr",
        });
        let used = compute_signatures(&SignatureInput {
            brand: Some("Apple"),
            model: Some("iPhone 13"),
            reference: None,
            capacity_gb: Some(128),
            functional_state: FunctionalState::Ok,
            condition_grade: ConditionGrade::Used,
            locale: "fr",
        });
        assert_eq!(new.loose, used.loose);
        assert_ne!(new.strict, used.strict);
    }

    #[test]
    fn broken_variant_has_different_signature() {
        let ok = compute_signatures(&SignatureInput {
            brand: Some("Apple"),
            model: Some("iPhone 12"),
            reference: None,
            capacity_gb: Some(64),
            functional_state: FunctionalState::Ok,
            condition_grade: ConditionGrade::Unknown,
            locale: "fr",
        });
        let broken = compute_signatures(&SignatureInput {
            brand: Some("Apple"),
            model: Some("iPhone 12"),
            reference: None,
            capacity_gb: Some(64),
            functional_state: FunctionalState::Broken,
            condition_grade: ConditionGrade::Unknown,
            locale: "fr",
        });
        assert_ne!(ok.strict, broken.strict);
    }

    #[test]
    fn hints_detect_broken_and_condition_markers() {
        let hints = build_hints("iPhone 12 HS pour pièces");
        assert!(hints.broken_confidence >= 0.8);
        assert!(!hints.broken_indicators.is_empty());
    }
}
