//! Shopping Provider
//! Mission: fetch comparable listings for a normalized query from an
//! upstream shopping search API. Swappable behind a trait so tests never
//! hit the network.

use crate::relevance::ScoredResult;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum ShoppingError {
    Request(String),
    Empty,
}

impl fmt::Display for ShoppingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShoppingError::Request(msg) => write!(f, "upstream request failed: {msg}"),
            ShoppingError::Empty => write!(f, "upstream returned no usable results"),
        }
    }
}

impl std::error::Error for ShoppingError {}

#[async_trait]
pub trait ShoppingProvider: Send + Sync {
    async fn search(&self, query: &str, locale: &str) -> Result<Vec<ScoredResult>, ShoppingError>;
}

/// Real upstream: a generic shopping-search HTTP API, keyed by bearer token.
/// Shape of the wire response is intentionally loose — only the fields this
/// crate needs are extracted, everything else is ignored.
pub struct HttpShoppingProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(serde::Deserialize)]
struct RawSearchResponse {
    #[serde(default)]
    items: Vec<RawItem>,
}

#[derive(serde::Deserialize)]
struct RawItem {
    title: String,
    url: String,
    price: f64,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default)]
    relevance: f32,
}

fn default_currency() -> String {
    "EUR".to_string()
}

impl HttpShoppingProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(8))
                .build()
                .expect("reqwest client builder"),
            api_key,
            endpoint: "https://api.shopping-search.example/v1/search".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[async_trait]
impl ShoppingProvider for HttpShoppingProvider {
    async fn search(&self, query: &str, locale: &str) -> Result<Vec<ScoredResult>, ShoppingError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&self.api_key)
            .query(&[("q", query), ("locale", locale)])
            .send()
            .await
            .map_err(|e| ShoppingError::Request(e.to_string()))?;

        let resp = resp
            .error_for_status()
            .map_err(|e| ShoppingError::Request(e.to_string()))?;

        let parsed: RawSearchResponse = resp
            .json()
            .await
            .map_err(|e| ShoppingError::Request(e.to_string()))?;

        if parsed.items.is_empty() {
            return Err(ShoppingError::Empty);
        }

        Ok(parsed
            .items
            .into_iter()
            .map(|item| ScoredResult {
                title: item.title,
                url: item.url,
                price: item.price,
                currency: item.currency,
                relevance: item.relevance,
            })
            .collect())
    }
}

/// Test double returning a fixed result set regardless of query, used by
/// integration tests and by callers that want to bypass the network
/// entirely.
pub struct StaticShoppingProvider {
    results: Vec<ScoredResult>,
}

impl StaticShoppingProvider {
    pub fn new(results: Vec<ScoredResult>) -> Self {
        Self { results }
    }

    pub fn empty() -> Self {
        Self { results: Vec::new() }
    }
}

#[async_trait]
impl ShoppingProvider for StaticShoppingProvider {
    async fn search(&self, _query: &str, _locale: &str) -> Result<Vec<ScoredResult>, ShoppingError> {
        if self.results.is_empty() {
            return Err(ShoppingError::Empty);
        }
        Ok(self.results.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(price: f64) -> ScoredResult {
        ScoredResult {
            title: "t".into(),
            url: "u".into(),
            price,
            currency: "EUR".into(),
            relevance: 0.9,
        }
    }

    #[tokio::test]
    async fn static_provider_returns_configured_results() {
        let provider = StaticShoppingProvider::new(vec![result(100.0), result(200.0)]);
        let out = provider.search("iphone 13", "fr").await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn static_provider_empty_errors() {
        let provider = StaticShoppingProvider::empty();
        assert!(matches!(
            provider.search("x", "fr").await,
            Err(ShoppingError::Empty)
        ));
    }
}
