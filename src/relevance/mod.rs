//! Relevance & Stats
//! Mission: filter raw shopping results down to the ones worth comparing
//! against, then summarize them into a verdict the caller can act on.

use serde::{Deserialize, Serialize};

const PRODUCT_THRESHOLD: f32 = 0.25;
const VEHICLE_THRESHOLD: f32 = 0.15;
const FALLBACK_THRESHOLD: f32 = 0.05;
const VEHICLE_PRICE_FLOOR_RATIO: f64 = 0.2;
const TOP_N: usize = 10;

/// A single scored candidate coming back from a shopping provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredResult {
    pub title: String,
    pub url: String,
    pub price: f64,
    pub currency: String,
    pub relevance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub average: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    WorthIt,
    Borderline,
    NotWorthIt,
}

/// Is this a vehicle comparison (affects threshold + price-floor sanity check)?
pub fn filter(
    results: &[ScoredResult],
    is_vehicle: bool,
    auction_price: f64,
) -> Vec<ScoredResult> {
    let threshold = if is_vehicle {
        VEHICLE_THRESHOLD
    } else {
        PRODUCT_THRESHOLD
    };
    let mut survivors = apply_filter(results, threshold, is_vehicle, auction_price);
    if survivors.is_empty() {
        survivors = apply_filter(results, FALLBACK_THRESHOLD, is_vehicle, auction_price);
    }
    survivors.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal));
    survivors.truncate(TOP_N);
    survivors
}

fn apply_filter(
    results: &[ScoredResult],
    threshold: f32,
    is_vehicle: bool,
    auction_price: f64,
) -> Vec<ScoredResult> {
    results
        .iter()
        .filter(|r| r.relevance >= threshold)
        .filter(|r| !is_vehicle || r.price >= VEHICLE_PRICE_FLOOR_RATIO * auction_price)
        .cloned()
        .collect()
}

/// Compute `{min, median, max, average, count}` over survivor prices.
/// Returns `None` when there is nothing to summarize.
pub fn compute_stats(survivors: &[ScoredResult]) -> Option<Stats> {
    if survivors.is_empty() {
        return None;
    }
    let mut prices: Vec<f64> = survivors.iter().map(|r| r.price).collect();
    prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let count = prices.len();
    let min = prices[0];
    let max = prices[count - 1];
    let sum: f64 = prices.iter().sum();
    let average = sum / count as f64;
    let median = if count % 2 == 1 {
        prices[count / 2]
    } else {
        (prices[count / 2 - 1] + prices[count / 2]) / 2.0
    };

    Some(Stats {
        min,
        median,
        max,
        average,
        count,
    })
}

/// `high` if ≥8 survivors and a tight IQR; `medium` if ≥4; else `low`.
/// Monotonic under added relevant data: adding a survivor to a set already
/// at `high`/`medium` thresholds never pushes the tier down, since we only
/// look at `count` and a relative (ratio, not absolute) spread measure.
pub fn compute_confidence(survivors: &[ScoredResult]) -> Confidence {
    let count = survivors.len();
    if count < 4 {
        return Confidence::Low;
    }
    if count < 8 {
        return Confidence::Medium;
    }

    let mut prices: Vec<f64> = survivors.iter().map(|r| r.price).collect();
    prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q1 = percentile(&prices, 0.25);
    let q3 = percentile(&prices, 0.75);
    let median = percentile(&prices, 0.5);
    let iqr_ratio = if median > 0.0 { (q3 - q1) / median } else { 0.0 };

    if iqr_ratio <= 0.5 {
        Confidence::High
    } else {
        Confidence::Medium
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// `worth_it` if `auctionPrice ≤ min * (1 - margin)`; `not_worth_it` if
/// `auctionPrice ≥ median`; `borderline` otherwise.
pub fn compute_verdict(auction_price: f64, stats: &Stats, margin: f64) -> Verdict {
    if auction_price <= stats.min * (1.0 - margin) {
        Verdict::WorthIt
    } else if auction_price >= stats.median {
        Verdict::NotWorthIt
    } else {
        Verdict::Borderline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(price: f64, relevance: f32) -> ScoredResult {
        ScoredResult {
            title: "t".into(),
            url: "u".into(),
            price,
            currency: "EUR".into(),
            relevance,
        }
    }

    #[test]
    fn filters_below_product_threshold() {
        let results = vec![result(100.0, 0.1), result(200.0, 0.3)];
        let survivors = filter(&results, false, 150.0);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].price, 200.0);
    }

    #[test]
    fn falls_back_to_low_threshold_when_empty() {
        let results = vec![result(100.0, 0.1), result(120.0, 0.08)];
        let survivors = filter(&results, false, 150.0);
        assert_eq!(survivors.len(), 2);
    }

    #[test]
    fn vehicle_sanity_check_drops_lowball_prices() {
        let results = vec![result(500.0, 0.5), result(20000.0, 0.5)];
        let survivors = filter(&results, true, 20000.0);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].price, 20000.0);
    }

    #[test]
    fn top_ten_cap() {
        let results: Vec<ScoredResult> = (0..15).map(|i| result(100.0 + i as f64, 0.9)).collect();
        let survivors = filter(&results, false, 100.0);
        assert_eq!(survivors.len(), TOP_N);
    }

    #[test]
    fn stats_median_even_and_odd() {
        let odd = vec![result(10.0, 0.9), result(30.0, 0.9), result(20.0, 0.9)];
        let stats = compute_stats(&odd).unwrap();
        assert_eq!(stats.median, 20.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);

        let even = vec![result(10.0, 0.9), result(20.0, 0.9), result(30.0, 0.9), result(40.0, 0.9)];
        let stats_even = compute_stats(&even).unwrap();
        assert_eq!(stats_even.median, 25.0);
    }

    #[test]
    fn confidence_monotonic_under_added_data() {
        let few: Vec<ScoredResult> = (0..3).map(|i| result(100.0 + i as f64, 0.9)).collect();
        let some: Vec<ScoredResult> = (0..5).map(|i| result(100.0 + i as f64, 0.9)).collect();
        let many: Vec<ScoredResult> = (0..9).map(|i| result(100.0 + i as f64, 0.9)).collect();
        assert!(compute_confidence(&few) <= compute_confidence(&some));
        assert!(compute_confidence(&some) <= compute_confidence(&many));
    }

    #[test]
    fn verdict_worth_it_when_below_min_margin() {
        let stats = Stats { min: 100.0, median: 150.0, max: 200.0, average: 150.0, count: 5 };
        assert_eq!(compute_verdict(80.0, &stats, 0.1), Verdict::WorthIt);
        assert_eq!(compute_verdict(160.0, &stats, 0.1), Verdict::NotWorthIt);
        assert_eq!(compute_verdict(120.0, &stats, 0.1), Verdict::Borderline);
    }
}
