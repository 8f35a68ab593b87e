//! Heuristic Normalizer
//! Mission: extract brand/model/reference/capacity/condition from a raw
//! title with no network calls, and build the upstream search query.

use super::{NormalizeRequest, NormalizedProduct};
use crate::canonical::{self, Category, Hints};

const BOILERPLATE_MARKERS: &[&str] = &[
    "lot n", "lot:", "ref:", "ref.", "reference:", "vente aux encheres", "auction",
    "tva", "vat", "frais de port", "shipping included", "port inclus",
];

const ACCESSORY_MARKERS: &[&str] = &[
    "case", "coque", "charger", "chargeur", "strap", "bracelet", "cable", "câble",
    "housing", "housse", "screen protector", "protection ecran", "adapter", "adaptateur",
];

const KNOWN_BRANDS: &[&str] = &[
    "apple", "iphone", "ipad", "macbook", "samsung", "galaxy", "volkswagen", "vw",
    "google", "pixel", "xiaomi", "redmi", "huawei", "sony", "playstation", "xbox",
    "microsoft", "renault", "peugeot", "citroen", "bmw", "audi", "mercedes", "ford",
];

const MAX_QUERY_LEN: usize = 60;

/// Remove lot/ref/auction/VAT boilerplate from a title.
pub fn strip_boilerplate(raw: &str) -> String {
    let mut cleaned = raw.to_string();
    let lower = raw.to_lowercase();
    for marker in BOILERPLATE_MARKERS {
        if let Some(pos) = lower.find(marker) {
            // Drop from the marker to the next comma/dash/end, conservatively.
            let rest = &cleaned[pos..];
            let cut = rest
                .find([',', '-', '|'])
                .map(|i| pos + i)
                .unwrap_or(cleaned.len());
            cleaned.replace_range(pos..cut, "");
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

pub fn looks_like_accessory(raw: &str) -> bool {
    let lower = raw.to_lowercase();
    ACCESSORY_MARKERS.iter().any(|m| lower.contains(m))
}

fn detect_brand(raw: &str) -> Option<String> {
    let lower = raw.to_lowercase();
    KNOWN_BRANDS
        .iter()
        .find(|b| lower.contains(*b))
        .map(|b| canonical::normalize_brand(b))
}

/// Reference pattern: two-or-more uppercase letters followed by 3+ digits,
/// e.g. "MK2N3" isn't matched (mixed case) but "AB1234" is.
fn detect_reference(raw: &str) -> Option<String> {
    let bytes: Vec<char> = raw.chars().collect();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i].is_ascii_uppercase() {
            let start = i;
            let mut j = i;
            while j < bytes.len() && bytes[j].is_ascii_uppercase() {
                j += 1;
            }
            let letters = j - start;
            let digit_start = j;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            let digits = j - digit_start;
            if letters >= 2 && digits >= 3 {
                return Some(bytes[start..j].iter().collect());
            }
            i = j.max(i + 1);
        } else {
            i += 1;
        }
    }
    None
}

/// Alphanumeric model token: a run of words that looks like a model number
/// ("13 Pro", "Golf 7", "S21 Ultra") immediately following the detected brand.
fn detect_model(raw: &str, brand_alias_hit: Option<&str>) -> Option<String> {
    let lower = raw.to_lowercase();
    let anchor = brand_alias_hit?;
    let pos = lower.find(anchor)?;
    let after = raw[pos + anchor.len()..].trim_start();
    if after.is_empty() {
        return None;
    }
    // Take up to 3 whitespace-separated tokens, stopping at boilerplate-ish
    // punctuation, forming the model descriptor (e.g. "13 Pro", "S21 Ultra").
    let tokens: Vec<&str> = after
        .split_whitespace()
        .take(3)
        .take_while(|t| !t.starts_with(['(', '-', '|', ',']))
        .collect();
    if tokens.is_empty() {
        return None;
    }
    Some(format!("{} {}", title_brand(anchor), tokens.join(" ")).trim().to_string())
}

fn title_brand(alias_hit: &str) -> String {
    // The model already leads with the brand-ish token the user typed
    // ("iPhone"), so reuse its casing via the alias table rather than the
    // canonical brand name (avoids "Apple 13 Pro" instead of "iPhone 13 Pro").
    match alias_hit {
        "iphone" => "iPhone".to_string(),
        "ipad" => "iPad".to_string(),
        "macbook" => "MacBook".to_string(),
        "galaxy" => "Galaxy".to_string(),
        other => canonical::title_case(other),
    }
}

fn detect_brand_alias_hit(raw: &str) -> Option<&'static str> {
    let lower = raw.to_lowercase();
    KNOWN_BRANDS.iter().find(|b| lower.contains(**b)).copied()
}

pub fn raw_capacity_token(raw: &str) -> Option<String> {
    let lower = raw.to_lowercase();
    for unit in ["tb", "to", "gb", "go"] {
        if let Some(pos) = lower.find(unit) {
            let prefix = &raw[..pos];
            let digits_end = prefix.trim_end();
            let start = digits_end
                .rfind(|c: char| !c.is_ascii_digit() && c != '.')
                .map(|i| i + 1)
                .unwrap_or(0);
            if start < digits_end.len() {
                return Some(format!("{}{}", &digits_end[start..], &raw[pos..pos + unit.len()]));
            }
        }
    }
    None
}

fn looks_like_vehicle(raw: &str, category_hint: Option<Category>) -> bool {
    if let Some(Category::Vehicle) = category_hint {
        return true;
    }
    let lower = raw.to_lowercase();
    ["golf", "clio", "renault", "peugeot", "citroen", "bmw", "audi", "mercedes", "ford", "tdi", "essence", "diesel"]
        .iter()
        .any(|w| lower.contains(w))
}

/// Brand+model (+year/engine if vehicle, +capacity otherwise), capped at 60 chars.
pub fn build_query(
    brand: &str,
    model: &str,
    capacity_gb: Option<i64>,
    category: Category,
    raw_title: &str,
) -> String {
    let mut query = format!("{} {}", brand, model).trim().to_string();
    if category == Category::Vehicle {
        if let Some(year) = find_year(raw_title) {
            query.push(' ');
            query.push_str(&year);
        }
    } else if let Some(gb) = capacity_gb {
        query.push(' ');
        query.push_str(&format!("{}GB", gb));
    }
    truncate_chars(&query, MAX_QUERY_LEN)
}

fn find_year(raw: &str) -> Option<String> {
    let bytes: Vec<char> = raw.chars().collect();
    for w in bytes.windows(4) {
        if w.iter().all(|c| c.is_ascii_digit()) {
            let year: String = w.iter().collect();
            if let Ok(n) = year.parse::<u32>() {
                if (1980..=2035).contains(&n) {
                    return Some(year);
                }
            }
        }
    }
    None
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Up to two alt queries: brand+model alone, plus "occasion" appended when used.
pub fn build_alt_queries(brand: &str, model: &str, raw_title: &str) -> Vec<String> {
    let mut alts = Vec::with_capacity(2);
    let base = truncate_chars(format!("{} {}", brand, model).trim(), MAX_QUERY_LEN);
    alts.push(base.clone());

    let (_, grade, _) = canonical::detect_condition_hints(raw_title);
    if grade == canonical::ConditionGrade::Used {
        alts.push(truncate_chars(&format!("{} occasion", base), MAX_QUERY_LEN));
    }
    alts.truncate(2);
    alts
}

pub fn normalize_heuristic(req: &NormalizeRequest, hints: &Hints) -> NormalizedProduct {
    let normalized_title = strip_boilerplate(&req.raw_title);
    let is_accessory = looks_like_accessory(&req.raw_title);

    let brand_alias_hit = detect_brand_alias_hit(&req.raw_title);
    let brand = req
        .brand_hint
        .clone()
        .or_else(|| detect_brand(&req.raw_title));
    let model = req
        .model_hint
        .clone()
        .or_else(|| detect_model(&req.raw_title, brand_alias_hit));
    let reference = detect_reference(&req.raw_title);
    let capacity_gb = canonical::parse_capacity_gb(&req.raw_title);
    let capacity = raw_capacity_token(&req.raw_title);

    let category = req.category_hint.unwrap_or_else(|| {
        if looks_like_vehicle(&req.raw_title, req.category_hint) {
            Category::Vehicle
        } else {
            Category::Product
        }
    });

    let (_, condition_grade, condition_confidence) =
        canonical::detect_condition_hints(&req.raw_title);

    // Deterministic functional_state: no AI opinion consulted yet, that
    // happens in the composite normalizer's merge step.
    let functional_state = canonical::resolve_functional_state(
        hints.broken_confidence,
        &canonical::AiStateOpinion::default(),
    );

    let query_brand = brand.clone().unwrap_or_default();
    let query_model = model.clone().unwrap_or_default();
    let query = build_query(&query_brand, &query_model, capacity_gb, category, &req.raw_title);
    let alt_queries = build_alt_queries(&query_brand, &query_model, &req.raw_title);

    let mut confidence = 0.3f32;
    if brand.is_some() {
        confidence += 0.15;
    }
    if model.is_some() {
        confidence += 0.15;
    }
    if reference.is_some() {
        confidence += 0.1;
    }
    if !is_accessory {
        confidence += 0.1;
    }
    confidence = confidence.min(0.8);

    let signatures = canonical::compute_signatures(&canonical::SignatureInput {
        brand: brand.as_deref(),
        model: model.as_deref(),
        reference: reference.as_deref(),
        capacity_gb,
        functional_state,
        condition_grade,
        locale: &req.locale,
    });

    NormalizedProduct {
        normalized_title,
        brand,
        model,
        reference,
        capacity,
        capacity_gb,
        category,
        condition_grade,
        functional_state,
        is_accessory,
        query,
        alt_queries,
        confidence,
        condition_confidence,
        hints: hints.clone(),
        signatures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Category;

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
    fn extracts_brand_model_and_capacity() {
        let hints = canonical::build_hints("iPhone 13 Pro 256 Go");
        let np = normalize_heuristic(&req("iPhone 13 Pro 256 Go"), &hints);
        assert_eq!(np.brand.as_deref(), Some("Apple"));
        assert!(np.model.as_deref().unwrap().contains("13 Pro"));
        assert_eq!(np.capacity_gb, Some(256));
        assert_eq!(np.functional_state, canonical::FunctionalState::Ok);
    }

    #[test]
    fn detects_reference_code() {
        assert_eq!(detect_reference("Lot AB1234 camera"), Some("AB1234".to_string()));
        assert_eq!(detect_reference("no reference here"), None);
    }

    #[test]
    fn accessory_detection() {
        assert!(looks_like_accessory("iPhone leather case"));
        assert!(!looks_like_accessory("iPhone 13 Pro 256GB"));
    }

    #[test]
    fn query_capped_at_60_chars() {
        let long_model = "Pro Max Ultra Special Edition Collector Series Limited Run Two Thousand";
        let q = build_query("Apple", long_model, Some(256), Category::Product, "");
        assert!(q.chars().count() <= 60);
    }

    #[test]
    fn confidence_increases_with_signal_richness() {
        let hints_thin = canonical::build_hints("stuff for sale");
        let thin = normalize_heuristic(&req("stuff for sale"), &hints_thin);
        let hints_rich = canonical::build_hints("iPhone 13 Pro 256 Go Ref AB1234");
        let rich = normalize_heuristic(&req("iPhone 13 Pro 256 Go Ref AB1234"), &hints_rich);
        assert!(rich.confidence > thin.confidence);
    }
}
