//! Normalization Cache
//! Mission: in-memory LRU of normalization results keyed by a fingerprint of
//! the raw input, so repeated lookups of the same title/site/locale/hints
//! skip both the AI call and the heuristic extraction.

use super::NormalizedProduct;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_ENTRIES: usize = 10_000;
const TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

struct Entry {
    value: NormalizedProduct,
    inserted_at: Instant,
}

/// Fingerprint key = SHA-256 of `(raw_title lowered+trimmed, locale,
/// siteDomain, brandHint, modelHint)`.
pub fn fingerprint(
    raw_title: &str,
    locale: &str,
    site_domain: &str,
    brand_hint: Option<&str>,
    model_hint: Option<&str>,
) -> String {
    let tuple = format!(
        "{}|{}|{}|{}|{}",
        raw_title.trim().to_lowercase(),
        locale.trim().to_lowercase(),
        site_domain.trim().to_lowercase(),
        brand_hint.unwrap_or("").trim().to_lowercase(),
        model_hint.unwrap_or("").trim().to_lowercase(),
    );
    let mut hasher = Sha256::new();
    hasher.update(tuple.as_bytes());
    hex::encode(hasher.finalize())
}

/// A simple LRU: insertion/access order tracked via a `Vec<String>` of keys
/// (most-recently-used last), `parking_lot::Mutex`-guarded for short
/// critical sections, matching the rest of the process-local caches in
/// this crate.
pub struct NormalizationCache {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
}

impl Default for NormalizationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NormalizationCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<NormalizedProduct> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > TTL,
            None => return None,
        };
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        touch(&mut inner.order, key);
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: String, value: NormalizedProduct) {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= MAX_ENTRIES {
            if let Some(oldest) = pop_oldest(&mut inner.order) {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(
            key.clone(),
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        touch(&mut inner.order, &key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn touch(order: &mut Vec<String>, key: &str) {
    order.retain(|k| k != key);
    order.push(key.to_string());
}

fn pop_oldest(order: &mut Vec<String>) -> Option<String> {
    if order.is_empty() {
        None
    } else {
        Some(order.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{Category, ConditionGrade, FunctionalState, Hints, Signatures};

    fn sample_product(title: &str) -> NormalizedProduct {
        NormalizedProduct {
            normalized_title: title.to_string(),
            brand: None,
            model: None,
            reference: None,
            capacity: None,
            capacity_gb: None,
            category: Category::Product,
            condition_grade: ConditionGrade::Unknown,
            functional_state: FunctionalState::Ok,
            is_accessory: false,
            query: title.to_string(),
            alt_queries: vec![],
            confidence: 0.5,
            condition_confidence: 0.0,
            hints: Hints::default(),
            signatures: Signatures {
                strict: "x".repeat(32),
                loose: "y".repeat(32),
            },
        }
    }

    #[test]
    fn fingerprint_is_case_and_whitespace_insensitive() {
        let a = fingerprint(" iPhone 13 ", "FR", "example.test", None, None);
        let b = fingerprint("iphone 13", "fr", "EXAMPLE.TEST", None, None);
        assert_eq!(a, b);
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = NormalizationCache::new();
        let key = fingerprint("title", "fr", "site", None, None);
        cache.put(key.clone(), sample_product("title"));
        let got = cache.get(&key).unwrap();
        assert_eq!(got.normalized_title, "title");
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache = NormalizationCache::new();
        for i in 0..MAX_ENTRIES {
            cache.put(format!("k{i}"), sample_product("t"));
        }
        assert_eq!(cache.len(), MAX_ENTRIES);
        // Touch k1 so it's not the least-recently-used anymore.
        cache.get("k1");
        cache.put("k_new".to_string(), sample_product("t"));
        assert_eq!(cache.len(), MAX_ENTRIES);
        assert!(cache.get("k0").is_none(), "k0 should have been evicted");
        assert!(cache.get("k1").is_some(), "k1 was touched, should survive");
    }
}
