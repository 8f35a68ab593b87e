//! Configuration
//! Mission: read process configuration from the environment once at
//! startup into a single typed struct.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProviderKind {
    None,
    Anthropic,
    OpenAi,
    Ollama,
}

impl AiProviderKind {
    fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "anthropic" => AiProviderKind::Anthropic,
            "openai" => AiProviderKind::OpenAi,
            "ollama" => AiProviderKind::Ollama,
            _ => AiProviderKind::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub shopping_api_key: Option<String>,
    pub ai_provider: AiProviderKind,
    pub ai_api_key: Option<String>,
    pub ai_model: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_price_ids: StripePriceIds,
    pub app_base_url: String,
    pub free_fresh_fetch_allowance: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StripePriceIds {
    pub pack_1: Option<String>,
    pub pack_5: Option<String>,
    pub pack_10: Option<String>,
    pub pack_30: Option<String>,
    pub pack_100: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./compare-backend.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let shopping_api_key = std::env::var("SHOPPING_API_KEY").ok();

        let ai_provider = std::env::var("AI_PROVIDER")
            .map(|s| AiProviderKind::from_env_str(&s))
            .unwrap_or(AiProviderKind::None);
        let ai_api_key = std::env::var("AI_API_KEY").ok();
        let ai_model = std::env::var("AI_MODEL").ok();

        let stripe_secret_key = std::env::var("STRIPE_SECRET_KEY").ok();
        let stripe_webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").ok();
        let stripe_price_ids = StripePriceIds {
            pack_1: std::env::var("STRIPE_PRICE_PACK_1").ok(),
            pack_5: std::env::var("STRIPE_PRICE_PACK_5").ok(),
            pack_10: std::env::var("STRIPE_PRICE_PACK_10").ok(),
            pack_30: std::env::var("STRIPE_PRICE_PACK_30").ok(),
            pack_100: std::env::var("STRIPE_PRICE_PACK_100").ok(),
        };

        let app_base_url =
            std::env::var("APP_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());

        let free_fresh_fetch_allowance = std::env::var("FREE_FRESH_FETCH_ALLOWANCE")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .unwrap_or(1);

        Ok(Self {
            database_path,
            port,
            shopping_api_key,
            ai_provider,
            ai_api_key,
            ai_model,
            stripe_secret_key,
            stripe_webhook_secret,
            stripe_price_ids,
            app_base_url,
            free_fresh_fetch_allowance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ai_provider_defaults_to_none_on_unknown_value() {
        assert_eq!(AiProviderKind::from_env_str("nonsense"), AiProviderKind::None);
        assert_eq!(AiProviderKind::from_env_str("Anthropic"), AiProviderKind::Anthropic);
    }
}
